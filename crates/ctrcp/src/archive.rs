//! Archive production.
//!
//! [`ArchiveBuilder`] walks a file or directory tree and yields
//! [`ArchiveEntry`] values lazily, parents before children and siblings in
//! byte order of their names. [`write_archive`] serializes such a sequence
//! into a tar stream.
//!
//! Traversal below the root goes through `cap_std` directory handles, so a
//! directory swapped for a symlink mid-walk cannot redirect the walk
//! elsewhere on the host. File content is opened only when the entry is
//! written.
//!
//! Mount points below the root are read from the mount's host storage
//! rather than from whatever the underlying directory holds, and appear even
//! when the underlying directory lacks them.
//!
//! # Entry names
//!
//! Names are relative and `/`-separated. The root entry is named after the
//! copied item (its last container path component, or the host base name);
//! copying a container's `/` yields a root entry named `.` whose children
//! are named without a prefix.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cap_std::ambient_authority;
use cap_std::fs::{Dir, Metadata, MetadataExt};

use crate::error::{CopyError, Result};
use crate::mounts::{MountTable, Overlay};
use crate::paths::HostPath;
use crate::resolve::ResolvedPath;

/// Name of the root entry when the copy root has no name of its own.
pub const CURRENT_DIR_NAME: &str = ".";

/// What an entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link and its target, verbatim.
    Symlink(PathBuf),
}

/// One member of an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path relative to the copy root.
    pub name: PathBuf,
    /// Entry type.
    pub kind: EntryKind,
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Content length; zero for anything but files.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    content: Option<(Arc<Dir>, OsString)>,
}

impl ArchiveEntry {
    fn from_metadata(name: PathBuf, kind: EntryKind, metadata: &Metadata) -> Self {
        let size = match kind {
            EntryKind::File => metadata.len(),
            _ => 0,
        };
        Self {
            name,
            kind,
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            size,
            mtime: metadata.mtime(),
            content: None,
        }
    }

    /// Open the content of a file entry.
    ///
    /// Returns `None` for directories and symlinks.
    pub fn open(&self) -> Result<Option<std::fs::File>> {
        let Some((dir, name)) = &self.content else {
            return Ok(None);
        };
        let file = dir
            .open(name)
            .map_err(|e| CopyError::from_io(e, &self.name))?;
        Ok(Some(file.into_std()))
    }
}

/// Produces the entries for one copy root.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    real: PathBuf,
    root_name: PathBuf,
    label: String,
    overlays: Vec<Overlay>,
}

impl ArchiveBuilder {
    /// Archive `real`, naming the root entry `root_name`.
    ///
    /// `label` is what error messages call the root.
    pub fn new(real: impl Into<PathBuf>, root_name: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            real: real.into(),
            root_name: root_name.into(),
            label: label.into(),
            overlays: Vec::new(),
        }
    }

    /// Read the subtree at each overlay's relative path from its host storage.
    pub fn with_overlays(mut self, overlays: Vec<Overlay>) -> Self {
        self.overlays = overlays;
        self
    }

    /// Archive a resolved container path.
    ///
    /// The root is named after the container path that was reached, so a
    /// final symlink gives the name of its target and a mount point keeps its
    /// container-side name. Mounts below the root are followed.
    pub fn for_container(resolved: &ResolvedPath, mounts: &MountTable) -> Self {
        let root_name = resolved.container.file_name().unwrap_or(CURRENT_DIR_NAME);
        Self::new(
            resolved.real.as_path(),
            root_name,
            resolved.container.to_string(),
        )
        .with_overlays(mounts.overlays_below(&resolved.container))
    }

    /// Archive a host path, named by its base name.
    pub fn for_host(path: &Path) -> Result<Self> {
        let mut real = std::path::absolute(path).map_err(|e| CopyError::from_io(e, path))?;
        // `.`, `..` and `/` have no base name of their own.
        if real.file_name().is_none() {
            real = std::fs::canonicalize(&real).map_err(|e| CopyError::from_io(e, path))?;
        }
        let root_name = real
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CURRENT_DIR_NAME));
        Ok(Self::new(real, root_name, path.display().to_string()))
    }

    /// The name the root entry will carry.
    pub fn root_name(&self) -> &Path {
        &self.root_name
    }

    /// Start a fresh traversal.
    ///
    /// # Errors
    ///
    /// [`CopyError::NotFound`] if the root vanished since it was resolved.
    pub fn entries(&self) -> Result<Entries> {
        let not_found = |e: io::Error| CopyError::from_io(e, Path::new(&self.label));
        let (root, dir) = open_node(&self.real, self.root_name.clone())
            .map_err(not_found)?
            .ok_or_else(|| {
                CopyError::InvalidPath(format!(
                    "{}: cannot archive a socket, FIFO or device",
                    self.label
                ))
            })?;

        let overlays = self
            .overlays
            .iter()
            .map(|o| (o.relative.clone(), o.host_path.clone()))
            .collect();
        Ok(Entries {
            root: Some(root),
            root_dir: dir,
            overlays,
            stack: Vec::new(),
            skipped: 0,
        })
    }
}

/// Stat `real` and build its entry under `name`, opening it if it is a directory.
///
/// `Ok(None)` means `real` is a socket, FIFO or device.
fn open_node(real: &Path, name: PathBuf) -> io::Result<Option<(ArchiveEntry, Option<Dir>)>> {
    let (Some(parent), Some(file_name)) = (real.parent(), real.file_name()) else {
        // The host's `/`.
        let dir = Dir::open_ambient_dir(real, ambient_authority())?;
        let metadata = dir.dir_metadata()?;
        let entry = ArchiveEntry::from_metadata(name, EntryKind::Directory, &metadata);
        return Ok(Some((entry, Some(dir))));
    };

    let parent = Dir::open_ambient_dir(parent, ambient_authority())?;
    let metadata = parent.symlink_metadata(file_name)?;
    let file_name = file_name.to_os_string();
    let Some(kind) = entry_kind(&parent, &file_name, &metadata)? else {
        return Ok(None);
    };
    let mut entry = ArchiveEntry::from_metadata(name, kind, &metadata);
    let dir = match entry.kind {
        EntryKind::Directory => Some(parent.open_dir(&file_name)?),
        EntryKind::File => {
            entry.content = Some((Arc::new(parent), file_name));
            None
        }
        EntryKind::Symlink(_) => None,
    };
    Ok(Some((entry, dir)))
}

/// Classify a lstat result, reading the target of symlinks.
///
/// `None` means the entry cannot be archived.
fn entry_kind(dir: &Dir, name: &OsString, metadata: &Metadata) -> io::Result<Option<EntryKind>> {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        Ok(Some(EntryKind::Directory))
    } else if file_type.is_file() {
        Ok(Some(EntryKind::File))
    } else if file_type.is_symlink() {
        Ok(Some(EntryKind::Symlink(dir.read_link_contents(name)?)))
    } else {
        Ok(None)
    }
}

fn child_name(parent: &Path, child: &OsString) -> PathBuf {
    if parent == Path::new(CURRENT_DIR_NAME) {
        PathBuf::from(child)
    } else {
        parent.join(child)
    }
}

struct Frame {
    dir: Arc<Dir>,
    name: PathBuf,
    /// Path below the copy root, for matching overlays.
    rel: PathBuf,
    children: std::vec::IntoIter<OsString>,
}

impl Frame {
    fn open(dir: Dir, name: PathBuf, rel: PathBuf, overlays: &BTreeMap<PathBuf, HostPath>) -> io::Result<Self> {
        let mut children = Vec::new();
        for entry in dir.entries()? {
            children.push(entry?.file_name());
        }
        for mounted in overlays.keys() {
            if mounted.parent() == Some(rel.as_path())
                && let Some(child) = mounted.file_name()
            {
                children.push(child.to_os_string());
            }
        }
        children.sort();
        children.dedup();
        Ok(Self {
            dir: Arc::new(dir),
            name,
            rel,
            children: children.into_iter(),
        })
    }
}

/// Lazy, depth-first traversal produced by [`ArchiveBuilder::entries`].
///
/// The iterator stops after the first error.
pub struct Entries {
    root: Option<ArchiveEntry>,
    root_dir: Option<Dir>,
    /// Host storage keyed by mount point relative to the copy root.
    overlays: BTreeMap<PathBuf, HostPath>,
    stack: Vec<Frame>,
    skipped: usize,
}

impl Entries {
    /// Sockets, FIFOs and device nodes passed over so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn fail(&mut self, err: CopyError) -> Option<Result<ArchiveEntry>> {
        self.root_dir = None;
        self.stack.clear();
        Some(Err(err))
    }

    fn next_child(
        &mut self,
        dir: Arc<Dir>,
        child: OsString,
        name: PathBuf,
        rel: PathBuf,
    ) -> Result<Option<ArchiveEntry>> {
        let io_err = |e: io::Error| CopyError::from_io(e, &name);

        if let Some(host) = self.overlays.get(&rel).cloned() {
            tracing::trace!("archiving {} from mount {}", name.display(), host);
            let Some((entry, sub)) = open_node(host.as_path(), name.clone()).map_err(io_err)? else {
                self.skipped += 1;
                return Ok(None);
            };
            if let Some(sub) = sub {
                let frame = Frame::open(sub, name.clone(), rel, &self.overlays).map_err(io_err)?;
                self.stack.push(frame);
            }
            return Ok(Some(entry));
        }

        let metadata = dir.symlink_metadata(&child).map_err(io_err)?;
        let Some(kind) = entry_kind(&dir, &child, &metadata).map_err(io_err)? else {
            tracing::trace!("skipping special file {}", name.display());
            self.skipped += 1;
            return Ok(None);
        };

        let mut entry = ArchiveEntry::from_metadata(name.clone(), kind, &metadata);
        match entry.kind {
            EntryKind::Directory => {
                let sub = dir.open_dir(&child).map_err(io_err)?;
                let frame = Frame::open(sub, name.clone(), rel, &self.overlays).map_err(io_err)?;
                self.stack.push(frame);
            }
            EntryKind::File => entry.content = Some((dir, child)),
            EntryKind::Symlink(_) => {}
        }
        tracing::trace!("archiving {}", name.display());
        Ok(Some(entry))
    }
}

impl Iterator for Entries {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(root) = self.root.take() {
            if let Some(dir) = self.root_dir.take() {
                match Frame::open(dir, root.name.clone(), PathBuf::new(), &self.overlays) {
                    Ok(frame) => self.stack.push(frame),
                    Err(e) => return self.fail(CopyError::from_io(e, &root.name)),
                }
            }
            return Some(Ok(root));
        }

        loop {
            let frame = self.stack.last_mut()?;
            let Some(child) = frame.children.next() else {
                self.stack.pop();
                continue;
            };
            let dir = Arc::clone(&frame.dir);
            let name = child_name(&frame.name, &child);
            let rel = frame.rel.join(&child);
            match self.next_child(dir, child, name, rel) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return self.fail(e),
            }
        }
    }
}

/// Reads exactly `remaining` bytes, failing if the source runs short.
///
/// The header has already promised a size, so a file that shrinks while
/// being archived must not produce a truncated member.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while being archived",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn header_for(entry: &ArchiveEntry) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(match entry.kind {
        EntryKind::File => tar::EntryType::Regular,
        EntryKind::Directory => tar::EntryType::Directory,
        EntryKind::Symlink(_) => tar::EntryType::Symlink,
    });
    header.set_mode(entry.mode);
    header.set_uid(u64::from(entry.uid));
    header.set_gid(u64::from(entry.gid));
    header.set_mtime(entry.mtime.max(0) as u64);
    header.set_size(entry.size);
    header
}

/// Serialize `entries` as a tar stream into `sink`.
///
/// Returns the number of entries written. On error the caller must not
/// treat whatever reached `sink` as a complete archive.
pub fn write_archive<I, W>(entries: I, sink: W) -> Result<usize>
where
    I: IntoIterator<Item = Result<ArchiveEntry>>,
    W: Write,
{
    let mut builder = tar::Builder::new(sink);
    let mut count = 0usize;

    for entry in entries {
        let entry = entry?;
        let mut header = header_for(&entry);

        if entry.name == Path::new(CURRENT_DIR_NAME) {
            // tar refuses to encode a bare `.` through set_path.
            header.as_old_mut().name[..2].copy_from_slice(b"./");
            header.set_cksum();
            builder.append(&header, io::empty())?;
        } else {
            match &entry.kind {
                EntryKind::File => {
                    let file = entry.open()?.ok_or_else(|| {
                        CopyError::InvalidPath(format!("{}: no content", entry.name.display()))
                    })?;
                    let reader = ExactReader {
                        inner: file,
                        remaining: entry.size,
                    };
                    builder.append_data(&mut header, &entry.name, reader)?;
                }
                EntryKind::Directory => {
                    builder.append_data(&mut header, &entry.name, io::empty())?;
                }
                EntryKind::Symlink(target) => {
                    builder.append_link(&mut header, &entry.name, target)?;
                }
            }
        }
        count += 1;
    }

    builder.into_inner()?.flush()?;
    Ok(count)
}

//! Archive extraction.
//!
//! [`ArchiveExtractor`] consumes a tar stream and either materializes it
//! below a destination directory or forwards the raw bytes to a sink.
//!
//! # Destinations
//!
//! - [`Destination::Directory`]: entries are written below an existing
//!   directory under their own names.
//! - [`Destination::Rename`]: the archive root is written as `name` inside
//!   `parent`, and everything below it follows. This is how `cp ctr:/etc/hosts
//!   ./copy` produces a file called `copy`.
//! - [`Destination::Stream`]: bytes are copied verbatim.
//!
//! Every write goes through a `cap_std` handle on the destination directory,
//! so neither a hostile entry name nor a symlink that already exists (or
//! that an earlier entry created) can place data outside it. There is no
//! rollback: entries written before a failure stay written.
//!
//! Directory permissions and timestamps are applied after the archive has
//! been consumed, deepest first, so read-only directories can still be
//! filled and their mtimes survive the writes below them.
//!
//! # Mounts below the destination
//!
//! [`ArchiveExtractor::with_overlays`] layers mounts over the destination.
//! An entry at or below an overlay is written to that mount's host storage
//! through a handle opened on first use; entries under a read-only overlay
//! fail with [`CopyError::PermissionDenied`]. A directory entry naming a
//! mount point is accepted without touching the mount itself.
//!
//! Owner, group and mtime are optional in a header. Missing ones are left as
//! the filesystem sets them; a missing mode is only an error when
//! permissions are being preserved.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::{Dir, Permissions};
use rustix::fs::{AtFlags, Gid, Timespec, Timestamps, Uid};

use crate::error::{CopyError, Result};
use crate::mounts::Overlay;
use crate::paths::HostPath;

/// Statistics from one extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    /// Number of regular files written.
    pub files_extracted: usize,
    /// Number of directory entries processed.
    pub directories_created: usize,
    /// Number of symlinks created.
    pub symlinks_created: usize,
    /// Number of hardlinks created.
    pub hardlinks_created: usize,
    /// Bytes of file content written.
    pub bytes_written: u64,
    /// Bytes forwarded in stream mode.
    pub bytes_passed_through: u64,
    /// Number of entries skipped (device files, FIFOs).
    pub entries_skipped: usize,
    /// Number of permission set failures (non-fatal).
    pub permission_failures: usize,
    /// Number of ownership set failures (non-fatal).
    pub ownership_failures: usize,
    /// Number of timestamp set failures (non-fatal).
    pub timestamp_failures: usize,
}

/// Options for extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionOptions {
    /// Apply the mode bits recorded in the archive.
    pub preserve_permissions: bool,
    /// Apply the recorded uid/gid (requires appropriate capabilities).
    pub preserve_ownership: bool,
    /// Apply the recorded modification times.
    pub preserve_mtime: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            preserve_permissions: true,
            preserve_ownership: false,
            preserve_mtime: true,
        }
    }
}

/// Where an archive ends up.
pub enum Destination {
    /// Extract below this existing directory.
    Directory(PathBuf),
    /// Extract the archive root as `name` inside the existing directory `parent`.
    Rename {
        /// Directory receiving the renamed root.
        parent: PathBuf,
        /// New name for the archive root.
        name: OsString,
    },
    /// Forward the raw archive bytes.
    Stream(Box<dyn Write + Send>),
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            Destination::Rename { parent, name } => f
                .debug_struct("Rename")
                .field("parent", parent)
                .field("name", name)
                .finish(),
            Destination::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Reject absolute, `..` and over-long entry names, dropping `.` components.
///
/// The result is empty for the archive's `./` root.
fn sanitize_entry_name(raw: &Path) -> Result<PathBuf> {
    let bytes = raw.as_os_str().as_encoded_bytes();
    if bytes.len() > libc::PATH_MAX as usize {
        return Err(CopyError::InvalidPath(format!(
            "entry name exceeds PATH_MAX ({} bytes)",
            libc::PATH_MAX
        )));
    }
    if bytes.contains(&0) {
        return Err(CopyError::InvalidPath("entry name contains null byte".into()));
    }

    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(CopyError::InvalidPath(format!(
                    "unsafe entry name: {}",
                    raw.display()
                )));
            }
        }
    }
    Ok(clean)
}

/// Maps sanitized entry names to paths below the destination handle.
enum NameMap {
    Identity,
    /// The first entry fixes `root`; names below it move under `name`.
    Rename {
        name: PathBuf,
        root: Option<PathBuf>,
    },
}

impl NameMap {
    fn map(&mut self, entry_name: PathBuf) -> Result<PathBuf> {
        match self {
            NameMap::Identity => Ok(entry_name),
            NameMap::Rename { name, root } => {
                let root = root.get_or_insert_with(|| entry_name.clone());
                let rest = entry_name.strip_prefix(&*root).map_err(|_| {
                    CopyError::InvalidPath(format!(
                        "entry {} is outside the archive root {}",
                        entry_name.display(),
                        root.display()
                    ))
                })?;
                if rest.as_os_str().is_empty() {
                    Ok(name.clone())
                } else {
                    Ok(name.join(rest))
                }
            }
        }
    }

    /// Hard link targets name earlier entries and go through the same mapping.
    fn map_existing(&self, entry_name: PathBuf) -> Result<PathBuf> {
        match self {
            NameMap::Identity => Ok(entry_name),
            NameMap::Rename { name, root } => {
                let root = root.as_deref().unwrap_or(Path::new(""));
                match entry_name.strip_prefix(root) {
                    Ok(rest) if rest.as_os_str().is_empty() => Ok(name.clone()),
                    Ok(rest) => Ok(name.join(rest)),
                    Err(_) => Err(CopyError::InvalidPath(format!(
                        "link target {} is outside the archive root",
                        entry_name.display()
                    ))),
                }
            }
        }
    }
}

/// Metadata recorded for a directory, applied once the archive is done.
struct DeferredDir {
    /// Handle the path is relative to; `None` is the destination itself.
    at: Option<usize>,
    path: PathBuf,
    mode: Option<u32>,
    mtime: Option<u64>,
}

/// An overlay and, once used, its handle plus the mount's name inside it.
struct MountTarget {
    overlay: Overlay,
    opened: Option<(Dir, PathBuf)>,
}

/// The destination handle and the mounts layered over it, deepest first.
struct Targets {
    dest: Dir,
    mounts: Vec<MountTarget>,
}

impl Targets {
    fn new(dest: Dir, overlays: &[Overlay]) -> Self {
        let mut mounts: Vec<MountTarget> = overlays
            .iter()
            .cloned()
            .map(|overlay| MountTarget {
                overlay,
                opened: None,
            })
            .collect();
        mounts.sort_by_key(|m| std::cmp::Reverse(m.overlay.relative.components().count()));
        Self { dest, mounts }
    }

    /// Which handle `path` belongs to, and its path relative to that handle.
    fn route(&mut self, path: &Path) -> Result<(Option<usize>, PathBuf)> {
        let Some(index) = self
            .mounts
            .iter()
            .position(|m| path.starts_with(&m.overlay.relative))
        else {
            return Ok((None, path.to_path_buf()));
        };
        let mount = &mut self.mounts[index];
        if mount.overlay.read_only {
            return Err(CopyError::PermissionDenied(format!(
                "{} is on a read-only mount",
                path.display()
            )));
        }
        if mount.opened.is_none() {
            mount.opened = Some(open_mount(&mount.overlay.host_path)?);
        }

        let base = mount
            .opened
            .as_ref()
            .map_or(Path::new(""), |(_, base)| base.as_path());
        let rest = path.strip_prefix(&mount.overlay.relative).unwrap_or(Path::new(""));
        let routed = if rest.as_os_str().is_empty() {
            base.to_path_buf()
        } else {
            base.join(rest)
        };
        Ok((Some(index), routed))
    }

    fn dir(&self, at: Option<usize>) -> Result<&Dir> {
        match at {
            None => Ok(&self.dest),
            Some(index) => self
                .mounts
                .get(index)
                .and_then(|m| m.opened.as_ref())
                .map(|(dir, _)| dir)
                .ok_or_else(|| CopyError::Io(io::Error::other("mount handle used before opening"))),
        }
    }
}

/// A directory mount is its own handle; a file mount is named inside its parent.
fn open_mount(host: &HostPath) -> Result<(Dir, PathBuf)> {
    let path = host.as_path();
    let is_dir = std::fs::metadata(path).is_ok_and(|m| m.is_dir());
    let (dir_path, base) = match (is_dir, path.parent(), path.file_name()) {
        (false, Some(parent), Some(name)) => (parent, PathBuf::from(name)),
        _ => (path, PathBuf::new()),
    };
    tracing::trace!("opening mount {} for writing", host);
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
        .map_err(|e| CopyError::from_io(e, dir_path))?;
    Ok((dir, base))
}

/// Materializes or forwards archive streams.
#[derive(Debug, Clone, Default)]
pub struct ArchiveExtractor {
    options: ExtractionOptions,
    overlays: Vec<Overlay>,
}

impl ArchiveExtractor {
    /// Create an extractor.
    pub fn new(options: ExtractionOptions) -> Self {
        Self {
            options,
            overlays: Vec::new(),
        }
    }

    /// Route entries at or below each overlay's relative path to its host storage.
    ///
    /// Relative paths are taken against the destination directory, after
    /// any rename has been applied.
    pub fn with_overlays(mut self, overlays: Vec<Overlay>) -> Self {
        self.overlays = overlays;
        self
    }

    /// Consume `input` into `destination`.
    ///
    /// The input is read to its end even after the archive's end marker, so
    /// a producer on the other side of a pipe never sees a broken pipe on
    /// success.
    pub fn extract<R: Read>(&self, mut input: R, destination: Destination) -> Result<ExtractionStats> {
        let mut stats = ExtractionStats::default();

        let (dir_path, mut names) = match destination {
            Destination::Stream(mut sink) => {
                stats.bytes_passed_through = io::copy(&mut input, &mut sink)?;
                sink.flush()?;
                return Ok(stats);
            }
            Destination::Directory(path) => (path, NameMap::Identity),
            Destination::Rename { parent, name } => (
                parent,
                NameMap::Rename {
                    name: PathBuf::from(name),
                    root: None,
                },
            ),
        };

        let dest = Dir::open_ambient_dir(&dir_path, ambient_authority())
            .map_err(|e| CopyError::from_io(e, &dir_path))?;
        tracing::debug!("extracting into {}", dir_path.display());

        let mut targets = Targets::new(dest, &self.overlays);
        let mut deferred = Vec::new();
        let mut archive = tar::Archive::new(input);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let raw = entry.path()?.into_owned();
            let path = names.map(sanitize_entry_name(&raw)?)?;

            let link = if entry.header().entry_type() == tar::EntryType::Link {
                let target = entry.link_name()?.ok_or_else(|| {
                    CopyError::InvalidPath(format!("hardlink {} has no target", path.display()))
                })?;
                let target = names.map_existing(sanitize_entry_name(&target)?)?;
                Some(targets.route(&target)?)
            } else {
                None
            };

            let (at, routed) = targets.route(&path)?;
            let link = match link {
                Some((link_at, _)) if link_at != at => {
                    return Err(CopyError::InvalidPath(format!(
                        "hardlink {} crosses a mount boundary",
                        path.display()
                    )));
                }
                Some((_, target)) => Some(target),
                None => None,
            };
            let dest = targets.dir(at)?;
            self.unpack_entry(dest, at, &routed, link, &mut entry, &mut deferred, &mut stats)?;
        }

        // Deepest first.
        deferred.sort_by(|a: &DeferredDir, b: &DeferredDir| b.path.cmp(&a.path));
        for dir in &deferred {
            self.apply_dir_metadata(targets.dir(dir.at)?, dir, &mut stats);
        }

        let mut rest = archive.into_inner();
        io::copy(&mut rest, &mut io::sink())?;

        tracing::debug!(
            "extracted {} files, {} dirs, {} symlinks ({} bytes)",
            stats.files_extracted,
            stats.directories_created,
            stats.symlinks_created,
            stats.bytes_written
        );
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn unpack_entry<R: Read>(
        &self,
        dest: &Dir,
        at: Option<usize>,
        path: &Path,
        link: Option<PathBuf>,
        entry: &mut tar::Entry<'_, R>,
        deferred: &mut Vec<DeferredDir>,
        stats: &mut ExtractionStats,
    ) -> Result<()> {
        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = if self.options.preserve_permissions {
            Some(header.mode()?)
        } else {
            header.mode().ok()
        };
        let owner = header.uid().ok().zip(header.gid().ok());
        let mtime = header.mtime().ok();

        // The `./` root of a Directory destination, or a directory mount point,
        // is an existing directory the entry must agree with.
        if path.as_os_str().is_empty() {
            if entry_type == tar::EntryType::Directory {
                return Ok(());
            }
            return Err(CopyError::InvalidPath(
                "cannot overwrite the destination directory with a non-directory".into(),
            ));
        }
        tracing::trace!("unpacking {}", path.display());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            dest.create_dir_all(parent)
                .map_err(|e| CopyError::from_io(e, parent))?;
        }

        let existing = match dest.symlink_metadata(path) {
            Ok(metadata) => Some(metadata),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(CopyError::from_io(e, path)),
        };
        let existing_is_dir = existing.as_ref().is_some_and(|m| m.is_dir());

        match entry_type {
            tar::EntryType::Directory => {
                match &existing {
                    Some(_) if existing_is_dir => {}
                    Some(_) => {
                        return Err(CopyError::InvalidPath(format!(
                            "cannot replace non-directory {} with a directory",
                            path.display()
                        )));
                    }
                    None => dest
                        .create_dir(path)
                        .map_err(|e| CopyError::from_io(e, path))?,
                }
                self.set_ownership(dest, path, owner, AtFlags::empty(), stats);
                deferred.push(DeferredDir {
                    at,
                    path: path.to_path_buf(),
                    mode,
                    mtime,
                });
                stats.directories_created += 1;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                refuse_directory(path, existing_is_dir)?;
                remove_existing(dest, path)?;
                let mut file = dest
                    .create(path)
                    .map_err(|e| CopyError::from_io(e, path))?
                    .into_std();
                stats.bytes_written += io::copy(entry, &mut file)?;
                drop(file);

                self.set_permissions(dest, path, mode, stats);
                self.set_ownership(dest, path, owner, AtFlags::empty(), stats);
                self.set_mtime(dest, path, mtime, stats);
                stats.files_extracted += 1;
            }
            tar::EntryType::Symlink => {
                refuse_directory(path, existing_is_dir)?;
                let target = entry.link_name()?.ok_or_else(|| {
                    CopyError::InvalidPath(format!("symlink {} has no target", path.display()))
                })?;
                remove_existing(dest, path)?;
                dest.symlink_contents(&*target, path)
                    .map_err(|e| CopyError::from_io(e, path))?;
                self.set_ownership(dest, path, owner, AtFlags::SYMLINK_NOFOLLOW, stats);
                self.set_mtime(dest, path, mtime, stats);
                stats.symlinks_created += 1;
            }
            tar::EntryType::Link => {
                refuse_directory(path, existing_is_dir)?;
                let target = link.ok_or_else(|| {
                    CopyError::InvalidPath(format!("hardlink {} has no target", path.display()))
                })?;
                remove_existing(dest, path)?;
                dest.hard_link(&target, dest, path)
                    .map_err(|e| CopyError::from_io(e, path))?;
                stats.hardlinks_created += 1;
            }
            other => {
                tracing::trace!("skipping {:?} entry {}", other, path.display());
                stats.entries_skipped += 1;
            }
        }

        Ok(())
    }

    fn set_permissions(&self, dest: &Dir, path: &Path, mode: Option<u32>, stats: &mut ExtractionStats) {
        if !self.options.preserve_permissions {
            return;
        }
        let Some(mode) = mode else {
            return;
        };
        let perms = Permissions::from_std(std::fs::Permissions::from_mode(mode));
        if dest.set_permissions(path, perms).is_err() {
            stats.permission_failures += 1;
        }
    }

    fn set_ownership(
        &self,
        dest: &Dir,
        path: &Path,
        owner: Option<(u64, u64)>,
        flags: AtFlags,
        stats: &mut ExtractionStats,
    ) {
        if !self.options.preserve_ownership {
            return;
        }
        let Some((uid, gid)) = owner else {
            return;
        };
        let (Ok(uid), Ok(gid)) = (u32::try_from(uid), u32::try_from(gid)) else {
            stats.ownership_failures += 1;
            return;
        };
        if rustix::fs::chownat(
            dest,
            path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            flags,
        )
        .is_err()
        {
            stats.ownership_failures += 1;
        }
    }

    fn set_mtime(&self, dest: &Dir, path: &Path, mtime: Option<u64>, stats: &mut ExtractionStats) {
        if !self.options.preserve_mtime {
            return;
        }
        let Some(mtime) = mtime else {
            return;
        };
        let when = Timespec {
            tv_sec: i64::try_from(mtime).unwrap_or(i64::MAX),
            tv_nsec: 0,
        };
        let times = Timestamps {
            last_access: when,
            last_modification: when,
        };
        if rustix::fs::utimensat(dest, path, &times, AtFlags::SYMLINK_NOFOLLOW).is_err() {
            stats.timestamp_failures += 1;
        }
    }

    fn apply_dir_metadata(&self, dest: &Dir, dir: &DeferredDir, stats: &mut ExtractionStats) {
        self.set_permissions(dest, &dir.path, dir.mode, stats);
        self.set_mtime(dest, &dir.path, dir.mtime, stats);
    }
}

/// Unlink whatever non-directory sits at `path`; only its absence is fine.
fn remove_existing(dest: &Dir, path: &Path) -> Result<()> {
    match dest.remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CopyError::from_io(e, path)),
    }
}

fn refuse_directory(path: &Path, existing_is_dir: bool) -> Result<()> {
    if existing_is_dir {
        return Err(CopyError::InvalidPath(format!(
            "cannot overwrite directory {} with a non-directory",
            path.display()
        )));
    }
    Ok(())
}

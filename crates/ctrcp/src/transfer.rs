//! Copy orchestration.
//!
//! [`Transfer`] turns two endpoint strings into a running pipeline:
//!
//! ```text
//! container -> host:  Resolver -> ArchiveBuilder --pipe--> ArchiveExtractor -> host dir | stdout
//! host -> container:  host path | stdin --pipe--> ArchiveExtractor -> resolved container dir
//! ```
//!
//! The producer runs on a scoped thread and writes into an OS pipe; the
//! extractor runs on the calling thread. The pipe's capacity bounds memory.
//! If the extractor fails it drops its end and the producer's next write
//! fails with `EPIPE`; if the producer fails it drops its end and the
//! extractor sees end-of-stream. When both fail, the producer's error is
//! reported.
//!
//! Mounts below the copied path are honored both ways: archiving reads them
//! from their host storage and extraction writes into it.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use rustix::pipe::{PipeFlags, pipe_with};

use crate::archive::{ArchiveBuilder, Entries, write_archive};
use crate::endpoint::{Direction, Endpoint, STREAM_PATH};
use crate::error::{CopyError, Result, Stage, TransferError};
use crate::extract::{ArchiveExtractor, Destination, ExtractionOptions, ExtractionStats};
use crate::mounts::{MountTable, Overlay};
use crate::paths::{ContainerPath, ContainerRoot};
use crate::resolve::{DEFAULT_MAX_SYMLINKS, ResolvedPath, Resolver};
use crate::store::{ContainerMetadata, ContainerStore};

/// The process streams a transfer may use for `-`.
pub struct TransferIo {
    /// Archive source for `- CONTAINER:PATH`.
    pub stdin: Box<dyn Read + Send>,
    /// Archive sink for `CONTAINER:PATH -`.
    pub stdout: Box<dyn Write + Send>,
}

impl TransferIo {
    /// Use explicit streams.
    pub fn new(stdin: Box<dyn Read + Send>, stdout: Box<dyn Write + Send>) -> Self {
        Self { stdin, stdout }
    }

    /// Use the process's own standard input and output.
    pub fn inherit() -> Self {
        Self::new(Box::new(io::stdin()), Box::new(io::stdout()))
    }
}

/// Tunables for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Symlink ceiling for path resolution.
    pub max_symlinks: usize,
    /// How extracted entries are written.
    pub extraction: ExtractionOptions,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_symlinks: DEFAULT_MAX_SYMLINKS,
            extraction: ExtractionOptions::default(),
        }
    }
}

/// What a successful transfer did.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Which way data went.
    pub direction: Direction,
    /// The container the copy touched.
    pub container_id: String,
    /// The symlink-free container path that was read or written.
    pub container_path: ContainerPath,
    /// Entries produced by the archive builder; zero for a `-` source.
    pub entries_archived: usize,
    /// Sockets, FIFOs and devices the archive builder passed over.
    pub special_files_skipped: usize,
    /// What the extractor did.
    pub stats: ExtractionStats,
}

/// Copies between a container and the host.
pub struct Transfer<'a> {
    store: &'a dyn ContainerStore,
    options: TransferOptions,
}

impl<'a> Transfer<'a> {
    /// Create a transfer against `store` with default options.
    pub fn new(store: &'a dyn ContainerStore) -> Self {
        Self {
            store,
            options: TransferOptions::default(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    /// Copy `source` to `destination`, each written as `CONTAINER:PATH` or a host path.
    pub fn run(
        &self,
        source: &str,
        destination: &str,
        io: TransferIo,
    ) -> std::result::Result<TransferReport, TransferError> {
        let parse = |raw: &str| Endpoint::parse(raw).map_err(|e| TransferError::new(Stage::Parse, e));
        let source = parse(source)?;
        let destination = parse(destination)?;
        let direction =
            Direction::of(&source, &destination).map_err(|e| TransferError::new(Stage::Parse, e))?;
        tracing::debug!("{}: {} -> {}", direction, source, destination);

        match direction {
            Direction::ContainerToHost => self.copy_out(&source, &destination, io),
            Direction::HostToContainer => self.copy_in(&source, &destination, io),
        }
    }

    /// Look up a container and resolve `path` inside it.
    pub fn resolve(
        &self,
        container: &str,
        path: &str,
    ) -> std::result::Result<(ContainerMetadata, ResolvedPath), TransferError> {
        let metadata = self.lookup(container)?;
        let (root, mounts) = self.layout(&metadata)?;
        let resolved = self
            .resolver(&root, &mounts)
            .resolve(path)
            .map_err(|e| TransferError::new(Stage::Resolve, e))?;
        Ok((metadata, resolved))
    }

    fn lookup(&self, reference: &str) -> std::result::Result<ContainerMetadata, TransferError> {
        self.store
            .lookup(reference)
            .map_err(|e| TransferError::new(Stage::Lookup, e))
    }

    /// The container's root and mount table.
    fn layout(
        &self,
        metadata: &ContainerMetadata,
    ) -> std::result::Result<(ContainerRoot, MountTable), TransferError> {
        let lookup_err = |e| TransferError::new(Stage::Lookup, e);
        let root = metadata.root().map_err(lookup_err)?;
        let mounts = metadata.mount_table().map_err(lookup_err)?;
        Ok((root, mounts))
    }

    fn resolver<'r>(&self, root: &'r ContainerRoot, mounts: &'r MountTable) -> Resolver<'r> {
        Resolver::new(root, mounts).with_max_symlinks(self.options.max_symlinks)
    }

    fn copy_out(
        &self,
        source: &Endpoint,
        destination: &Endpoint,
        io: TransferIo,
    ) -> std::result::Result<TransferReport, TransferError> {
        let container = source.container.as_deref().unwrap_or_default();
        let metadata = self.lookup(container)?;
        let (root, mounts) = self.layout(&metadata)?;
        let resolved = self
            .resolver(&root, &mounts)
            .resolve(&source.path)
            .map_err(|e| TransferError::new(Stage::Resolve, e))?;

        let builder = ArchiveBuilder::for_container(&resolved, &mounts);
        let entries = builder
            .entries()
            .map_err(|e| TransferError::new(Stage::Archive, e))?;

        let target = if destination.is_stream() {
            Destination::Stream(io.stdout)
        } else {
            host_destination(&destination.path).map_err(|e| TransferError::new(Stage::Extract, e))?
        };
        tracing::debug!("copying {} out of {} into {:?}", resolved.container, metadata.id, target);

        let extractor = ArchiveExtractor::new(self.options.extraction);
        let ((entries_archived, special_files_skipped), stats) =
            pipeline(move |sink| archive_into(entries, sink), extractor, target)?;

        Ok(TransferReport {
            direction: Direction::ContainerToHost,
            container_id: metadata.id,
            container_path: resolved.container,
            entries_archived,
            special_files_skipped,
            stats,
        })
    }

    fn copy_in(
        &self,
        source: &Endpoint,
        destination: &Endpoint,
        io: TransferIo,
    ) -> std::result::Result<TransferReport, TransferError> {
        let container = destination.container.as_deref().unwrap_or_default();
        let metadata = self.lookup(container)?;
        let (root, mounts) = self.layout(&metadata)?;
        let resolved = self
            .resolver(&root, &mounts)
            .resolve_for_write(&destination.path)
            .map_err(|e| TransferError::new(Stage::Resolve, e))?;

        if let Some(mount) = &resolved.via_mount
            && mount.read_only
        {
            return Err(TransferError::new(
                Stage::Resolve,
                CopyError::PermissionDenied(format!(
                    "{} is on read-only mount {}",
                    resolved.container, mount.container_path
                )),
            ));
        }

        let target = container_destination(&resolved, destination.path.ends_with('/'))
            .map_err(|e| TransferError::new(Stage::Resolve, e))?;
        tracing::debug!("copying {} into {} at {:?}", source, metadata.id, target);

        let overlays = container_overlays(&mounts, &resolved, &target);
        if !overlays.is_empty() {
            tracing::debug!("{} mounts below {}", overlays.len(), resolved.container);
        }
        let extractor = ArchiveExtractor::new(self.options.extraction).with_overlays(overlays);

        let ((entries_archived, special_files_skipped), stats) = if source.path == STREAM_PATH {
            let mut stdin = io.stdin;
            pipeline(
                move |sink| {
                    io::copy(&mut stdin, sink)?;
                    Ok((0, 0))
                },
                extractor,
                target,
            )?
        } else {
            let builder = ArchiveBuilder::for_host(Path::new(&source.path))
                .map_err(|e| TransferError::new(Stage::Resolve, e))?;
            let entries = builder
                .entries()
                .map_err(|e| TransferError::new(Stage::Archive, e))?;
            pipeline(move |sink| archive_into(entries, sink), extractor, target)?
        };

        Ok(TransferReport {
            direction: Direction::HostToContainer,
            container_id: metadata.id,
            container_path: resolved.container,
            entries_archived,
            special_files_skipped,
            stats,
        })
    }
}

/// Write `entries` as an archive, returning how many were written and skipped.
fn archive_into(mut entries: Entries, sink: &mut File) -> Result<(usize, usize)> {
    let count = write_archive(entries.by_ref(), sink)?;
    Ok((count, entries.skipped()))
}

/// Run `produce` against the write end of a pipe while `extractor` drains
/// the read end into `destination`.
fn pipeline<P, T>(
    produce: P,
    extractor: ArchiveExtractor,
    destination: Destination,
) -> std::result::Result<(T, ExtractionStats), TransferError>
where
    P: FnOnce(&mut File) -> Result<T> + Send,
    T: Send,
{
    let (read_end, write_end) = pipe_with(PipeFlags::CLOEXEC)
        .map_err(|e| TransferError::new(Stage::Archive, CopyError::Io(e.into())))?;
    let reader = File::from(read_end);
    let mut writer = File::from(write_end);

    let (produced, consumed) = std::thread::scope(|s| {
        let producer = s.spawn(move || {
            let result = produce(&mut writer);
            // Signal end-of-stream before the extractor waits on us.
            drop(writer);
            result
        });
        // The reader is dropped when extraction returns, unblocking the producer.
        let consumed = extractor.extract(reader, destination);
        let produced = producer.join().unwrap_or_else(|_| {
            Err(CopyError::Io(io::Error::other("archive producer panicked")))
        });
        (produced, consumed)
    });

    match (produced, consumed) {
        (Ok(produced), Ok(stats)) => Ok((produced, stats)),
        (Err(e), _) if !e.is_broken_pipe() => Err(TransferError::new(Stage::Archive, e)),
        (_, Err(e)) => Err(TransferError::new(Stage::Extract, e)),
        (Err(e), Ok(_)) => Err(TransferError::new(Stage::Archive, e)),
    }
}

/// Mounts below the container destination, relative to the directory the
/// extractor writes into.
fn container_overlays(mounts: &MountTable, resolved: &ResolvedPath, target: &Destination) -> Vec<Overlay> {
    let below = mounts.overlays_below(&resolved.container);
    match target {
        Destination::Directory(_) => below,
        Destination::Rename { name, .. } => below
            .into_iter()
            .map(|overlay| Overlay {
                relative: Path::new(name).join(&overlay.relative),
                ..overlay
            })
            .collect(),
        Destination::Stream(_) => Vec::new(),
    }
}

/// Pick how to write into host path `path`.
///
/// An existing directory receives the archive root under its own name.
/// Anything else becomes the new name of the archive root inside its parent,
/// which must exist. A trailing `/` insists on an existing directory.
pub fn host_destination(path: &str) -> Result<Destination> {
    let host = Path::new(path);
    let trailing_slash = path.ends_with('/');
    match std::fs::metadata(host) {
        Ok(metadata) if metadata.is_dir() => Ok(Destination::Directory(host.to_path_buf())),
        Ok(_) if trailing_slash => Err(CopyError::NotFound(format!("{} is not a directory", path))),
        Ok(_) => rename_into(host, path),
        Err(e) if e.kind() == io::ErrorKind::NotFound && trailing_slash => {
            Err(CopyError::NotFound(format!("directory {} does not exist", path)))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => rename_into(host, path),
        Err(e) => Err(CopyError::from_io(e, host)),
    }
}

fn rename_into(host: &Path, label: &str) -> Result<Destination> {
    let name = host
        .file_name()
        .ok_or_else(|| CopyError::InvalidPath(format!("{} does not name a file", label)))?;
    let parent = match host.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    match std::fs::metadata(&parent) {
        Ok(metadata) if metadata.is_dir() => Ok(Destination::Rename {
            parent,
            name: name.to_os_string(),
        }),
        Ok(_) => Err(CopyError::NotFound(format!("{} is not a directory", parent.display()))),
        Err(e) => Err(CopyError::from_io(e, &parent)),
    }
}

/// The container-side counterpart of [`host_destination`], working on
/// host storage the resolver already vetted.
fn container_destination(resolved: &ResolvedPath, trailing_slash: bool) -> Result<Destination> {
    let real = resolved.real.as_path();
    match std::fs::metadata(real) {
        Ok(metadata) if metadata.is_dir() => return Ok(Destination::Directory(real.to_path_buf())),
        Ok(_) if trailing_slash => {
            return Err(CopyError::NotFound(format!(
                "{} is not a directory",
                resolved.container
            )));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if trailing_slash {
                return Err(CopyError::NotFound(format!(
                    "directory {} does not exist",
                    resolved.container
                )));
            }
        }
        Err(e) => return Err(CopyError::from_io(e, Path::new(&resolved.container.to_string()))),
    }

    match (real.parent(), real.file_name()) {
        (Some(parent), Some(name)) => Ok(Destination::Rename {
            parent: parent.to_path_buf(),
            name: name.to_os_string(),
        }),
        _ => Err(CopyError::InvalidPath(format!(
            "cannot write to {}",
            resolved.container
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DirectoryStore;
    use std::os::unix::fs::{MetadataExt, symlink};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        tmp: TempDir,
        store: DirectoryStore,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let container_dir = tmp.path().join("store/containers/0123456789abcdef");
            let rootfs = container_dir.join("rootfs");
            std::fs::create_dir_all(rootfs.join("some/path")).unwrap();
            std::fs::create_dir_all(rootfs.join("ro")).unwrap();
            std::fs::write(rootfs.join("some/path/test"), "holla, i am the container").unwrap();
            symlink("/some/path/test", rootfs.join("container_path")).unwrap();
            std::fs::write(container_dir.join("hostname"), "0123456789ab\n").unwrap();

            let volume = tmp.path().join("volume");
            std::fs::create_dir_all(&volume).unwrap();
            std::fs::write(volume.join("bar"), "in the volume").unwrap();

            let config = serde_json::json!({
                "id": "0123456789abcdef",
                "name": "web",
                "rootfs": "rootfs",
                "mounts": [
                    { "destination": "/foo", "source": volume, "type": "volume" },
                    { "destination": "/ro", "source": volume, "read_only": true },
                ],
            });
            std::fs::write(container_dir.join("config.json"), config.to_string()).unwrap();

            std::fs::create_dir_all(tmp.path().join("host")).unwrap();
            let store = DirectoryStore::open(tmp.path().join("store")).unwrap();
            Self { tmp, store }
        }

        fn host(&self) -> PathBuf {
            self.tmp.path().join("host")
        }

        fn volume(&self) -> PathBuf {
            self.tmp.path().join("volume")
        }

        fn rootfs(&self) -> PathBuf {
            self.tmp
                .path()
                .join("store/containers/0123456789abcdef/rootfs")
        }

        fn run(&self, source: &str, destination: &str) -> std::result::Result<TransferReport, TransferError> {
            Transfer::new(&self.store).run(
                source,
                destination,
                TransferIo::new(Box::new(io::empty()), Box::new(io::sink())),
            )
        }
    }

    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }

    #[test]
    fn test_copy_file_out_into_directory() {
        let fx = Fixture::new();
        let report = fx
            .run(
                "web:../../../../../../some/path/test",
                &path_str(&fx.host()),
            )
            .unwrap();
        assert_eq!(report.direction, Direction::ContainerToHost);
        assert_eq!(report.container_path.to_string(), "/some/path/test");
        assert_eq!(report.entries_archived, 1);
        assert_eq!(
            std::fs::read_to_string(fx.host().join("test")).unwrap(),
            "holla, i am the container"
        );
    }

    #[test]
    fn test_copy_symlink_is_named_after_target() {
        let fx = Fixture::new();
        fx.run("web:/container_path", &path_str(&fx.host())).unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.host().join("test")).unwrap(),
            "holla, i am the container"
        );
    }

    #[test]
    fn test_copy_out_renames() {
        let fx = Fixture::new();
        let dest = fx.host().join("renamed");
        fx.run("0123:/some/path", &path_str(&dest)).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("test")).unwrap(),
            "holla, i am the container"
        );
    }

    #[test]
    fn test_copy_volume_and_special_file() {
        let fx = Fixture::new();
        fx.run("web:/foo", &path_str(&fx.host())).unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.host().join("foo/bar")).unwrap(),
            "in the volume"
        );

        fx.run("web:/etc/hostname", &path_str(&fx.host())).unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.host().join("hostname")).unwrap(),
            "0123456789ab\n"
        );
    }

    #[test]
    fn test_copy_to_stream() {
        let fx = Fixture::new();
        let captured = Captured::default();
        let report = Transfer::new(&fx.store)
            .run(
                "web:/some/path/test",
                "-",
                TransferIo::new(Box::new(io::empty()), Box::new(captured.clone())),
            )
            .unwrap();
        assert!(report.stats.bytes_passed_through > 0);

        let bytes = captured.0.lock().unwrap().clone();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap(), Path::new("test"));
        let on_disk = std::fs::metadata(fx.rootfs().join("some/path/test")).unwrap();
        assert_eq!(entry.header().mode().unwrap(), on_disk.mode() & 0o7777);
    }

    #[test]
    fn test_copy_in_and_back() {
        let fx = Fixture::new();
        std::fs::write(fx.host().join("upload"), "from the host").unwrap();

        let report = fx
            .run(&path_str(&fx.host().join("upload")), "web:/some/path")
            .unwrap();
        assert_eq!(report.direction, Direction::HostToContainer);
        assert_eq!(
            std::fs::read_to_string(fx.rootfs().join("some/path/upload")).unwrap(),
            "from the host"
        );

        fx.run(&path_str(&fx.host().join("upload")), "web:/some/path/renamed")
            .unwrap();
        assert!(fx.rootfs().join("some/path/renamed").is_file());
    }

    #[test]
    fn test_copy_in_through_absolute_symlink_stays_inside() {
        let fx = Fixture::new();
        symlink("/some/path", fx.rootfs().join("escape")).unwrap();
        std::fs::write(fx.host().join("upload"), "x").unwrap();

        fx.run(&path_str(&fx.host().join("upload")), "web:/escape/")
            .unwrap();
        assert!(fx.rootfs().join("some/path/upload").is_file());
    }

    #[test]
    fn test_copy_in_from_stdin() {
        let fx = Fixture::new();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(5);
        builder.append_data(&mut header, "streamed", &b"bytes"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        Transfer::new(&fx.store)
            .run(
                "-",
                "web:/",
                TransferIo::new(Box::new(io::Cursor::new(archive)), Box::new(io::sink())),
            )
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.rootfs().join("streamed")).unwrap(),
            "bytes"
        );
    }

    #[test]
    fn test_read_only_mount_refused() {
        let fx = Fixture::new();
        std::fs::write(fx.host().join("upload"), "x").unwrap();
        let err = fx
            .run(&path_str(&fx.host().join("upload")), "web:/ro")
            .unwrap_err();
        assert_eq!(err.stage, Stage::Resolve);
        assert!(matches!(err.error, CopyError::PermissionDenied(_)));
    }

    #[test]
    fn test_error_stages() {
        let fx = Fixture::new();
        let host = path_str(&fx.host());

        let err = fx.run("web:/a", "other:/b").unwrap_err();
        assert_eq!(err.stage, Stage::Parse);
        assert!(matches!(err.error, CopyError::AmbiguousEndpoint(_)));

        let err = fx.run("nope:/a", &host).unwrap_err();
        assert_eq!(err.stage, Stage::Lookup);
        assert!(matches!(err.error, CopyError::NotFound(_)));

        let err = fx.run("web:/does/not/exist", &host).unwrap_err();
        assert_eq!(err.stage, Stage::Resolve);

        let err = fx
            .run("web:/some/path/test", &path_str(&fx.host().join("missing/dir/x")))
            .unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
        assert!(matches!(err.error, CopyError::NotFound(_)));
    }

    #[test]
    fn test_copy_root_includes_nested_mounts() {
        let fx = Fixture::new();
        std::fs::create_dir(fx.rootfs().join("etc")).unwrap();
        let dest = fx.host().join("snapshot");

        let report = fx.run("web:/", &path_str(&dest)).unwrap();
        assert!(report.container_path.is_root());
        assert_eq!(
            std::fs::read_to_string(dest.join("foo/bar")).unwrap(),
            "in the volume"
        );
        assert_eq!(
            std::fs::read_to_string(dest.join("etc/hostname")).unwrap(),
            "0123456789ab\n"
        );
        assert_eq!(
            std::fs::read_to_string(dest.join("some/path/test")).unwrap(),
            "holla, i am the container"
        );
    }

    #[test]
    fn test_copy_in_lands_in_nested_mount() {
        let fx = Fixture::new();
        let src = fx.host().join("foo");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("uploaded"), "into the volume").unwrap();

        fx.run(&path_str(&src), "web:/").unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.volume().join("uploaded")).unwrap(),
            "into the volume"
        );
        assert!(!fx.rootfs().join("foo").exists());
    }

    #[test]
    fn test_copy_in_nested_read_only_mount_refused() {
        let fx = Fixture::new();
        let src = fx.host().join("ro");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("blocked"), "x").unwrap();

        let err = fx.run(&path_str(&src), "web:/").unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
        assert!(matches!(err.error, CopyError::PermissionDenied(_)), "{:?}", err);
        assert!(!fx.volume().join("blocked").exists());
    }

    #[test]
    fn test_skipped_special_files_are_reported() {
        let fx = Fixture::new();
        let _listener =
            std::os::unix::net::UnixListener::bind(fx.rootfs().join("some/path/sock")).unwrap();

        let report = fx.run("web:/some/path", &path_str(&fx.host())).unwrap();
        assert_eq!(report.entries_archived, 2);
        assert_eq!(report.special_files_skipped, 1);
        assert!(!fx.host().join("path/sock").exists());
    }

    #[test]
    fn test_failing_stream_sink_stops_the_producer() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("sink closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let fx = Fixture::new();
        // Several times the pipe capacity, so the producer is mid-write.
        std::fs::write(fx.rootfs().join("big"), vec![0x5a; 8 << 20]).unwrap();
        let err = Transfer::new(&fx.store)
            .run(
                "web:/big",
                "-",
                TransferIo::new(Box::new(io::empty()), Box::new(Closed)),
            )
            .unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
        assert!(matches!(err.error, CopyError::Io(_)), "{:?}", err);
    }

    #[test]
    fn test_extractor_failure_does_not_hang() {
        let fx = Fixture::new();
        // A regular file where the directory should go.
        std::fs::write(fx.host().join("path"), "in the way").unwrap();
        let err = fx.run("web:/some/path", &path_str(&fx.host())).unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
        assert!(matches!(err.error, CopyError::InvalidPath(_)));
    }
}

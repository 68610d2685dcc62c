#![forbid(unsafe_code)]
//! Copy files between the host and a container's filesystem.
//!
//! Paths are given as the container sees them. Resolving such a path on the
//! host is the hard part: `..` sequences, absolute symlinks and symlinks into
//! bind mounts must all be interpreted *inside* the container, without the
//! container running and without a chroot. The [`resolve`] module does that
//! walk by hand and guarantees the result stays within the container's root
//! filesystem or one of its declared mounts.
//!
//! # Overview
//!
//! A copy is a small pipeline:
//!
//! 1. [`endpoint`] parses `CONTAINER:PATH` and host-path arguments and picks
//!    the direction.
//! 2. [`store`] looks the container up; [`mounts`] builds its mount table.
//! 3. [`resolve`] turns the container path into a vetted host path.
//! 4. [`archive`] produces a tar stream from the source tree.
//! 5. [`extract`] unpacks that stream at the destination, or passes it
//!    through untouched for `-`.
//!
//! [`transfer`] wires these together with an OS pipe between producer and
//! consumer, so arbitrarily large trees are streamed.
//!
//! # Example
//!
//! ```no_run
//! use ctrcp::{DirectoryStore, Transfer, TransferIo};
//!
//! let store = DirectoryStore::open("/var/lib/ctrcp")?;
//! let report = Transfer::new(&store).run("web:/etc/hosts", "./hosts", TransferIo::inherit())?;
//! println!("copied {} entries", report.entries_archived);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Security
//!
//! - Excess `..` components clamp at the container root instead of failing.
//! - Absolute symlink targets restart resolution at the container root.
//! - Container path and host path are distinct types ([`ContainerPath`],
//!   [`HostPath`]); only the resolver converts one into the other.
//! - Archive traversal and extraction go through `cap_std::fs::Dir` handles,
//!   so neither hostile entry names nor pre-existing symlinks in the
//!   destination can redirect writes.

// Path model
pub mod error;
pub mod paths;

// Container metadata
pub mod mounts;
pub mod store;

// Resolution
pub mod resolve;

// Tar handling
pub mod archive;
pub mod extract;

// Orchestration
pub mod config;
pub mod endpoint;
pub mod transfer;

pub use archive::{ArchiveBuilder, ArchiveEntry, EntryKind, write_archive};
pub use config::CopyConfig;
pub use endpoint::{Direction, Endpoint};
pub use error::{CopyError, Result, Stage, TransferError};
pub use extract::{ArchiveExtractor, Destination, ExtractionOptions, ExtractionStats};
pub use mounts::{MountKind, MountPoint, MountTable, Overlay};
pub use paths::{ContainerPath, ContainerRoot, HostPath};
pub use resolve::{ResolvedPath, Resolver};
pub use store::{ContainerMetadata, ContainerStore, DeclaredMount, DeclaredMountKind, DirectoryStore};
pub use transfer::{Transfer, TransferIo, TransferOptions, TransferReport};

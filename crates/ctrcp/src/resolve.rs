//! Container path resolution.
//!
//! Turns a path as seen inside a container into the host path that backs it,
//! without ever leaving the container's storage. The walk is done by hand,
//! one component at a time, because neither the kernel's resolution nor
//! `canonicalize` know about the container: both would follow an absolute
//! symlink like `/container_path -> /some/path/test` to the *host's*
//! `/some/path/test`.
//!
//! # Rules
//!
//! - The request is always rooted at the container's `/`; `some/path` and
//!   `/some/path` are the same request.
//! - `..` at the container root is a no-op. Garbage like
//!   `../../../../some/path` clamps to `/some/path` instead of failing.
//! - Each component is mapped through the [`MountTable`]: below a mount
//!   point the host path comes from the mount's storage, elsewhere from the
//!   container root.
//! - Symlinks are read and spliced back into the work-list. Absolute targets
//!   restart at the container root; relative targets apply to the link's
//!   directory *in container terms*, so `..` can walk out of a mount and back
//!   into the root filesystem but never above `/`.
//! - A mount point itself is never followed: the mount replaces whatever the
//!   root filesystem holds at that path.
//! - At most `max_symlinks` links are followed per resolution.
//!
//! Because every component that reaches a host path is a plain file name
//! (no `/`, `.` or `..`), the result is lexically inside either the container
//! root or a mount's storage.

use std::collections::VecDeque;
use std::io;

use crate::error::{CopyError, Result};
use crate::mounts::{MountPoint, MountTable};
use crate::paths::{ContainerPath, ContainerRoot, HostPath, raw_components, validate_raw};

/// Symlinks followed before giving up, matching Linux's `MAXSYMLINKS`.
pub const DEFAULT_MAX_SYMLINKS: usize = 40;

/// The outcome of resolving one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// What the caller asked for, verbatim.
    pub requested: String,
    /// The symlink-free container path that was reached.
    pub container: ContainerPath,
    /// The host path backing it.
    pub real: HostPath,
    /// The mount that supplied `real`, if any.
    pub via_mount: Option<MountPoint>,
}

impl ResolvedPath {
    /// Whether the host path currently exists (without following a final symlink).
    pub fn exists(&self) -> bool {
        std::fs::symlink_metadata(self.real.as_path()).is_ok()
    }
}

/// Resolves container paths against one container's root and mounts.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    root: &'a ContainerRoot,
    mounts: &'a MountTable,
    max_symlinks: usize,
}

impl<'a> Resolver<'a> {
    /// Create a resolver with the default symlink limit.
    pub fn new(root: &'a ContainerRoot, mounts: &'a MountTable) -> Self {
        Self {
            root,
            mounts,
            max_symlinks: DEFAULT_MAX_SYMLINKS,
        }
    }

    /// Override the symlink limit.
    pub fn with_max_symlinks(mut self, max_symlinks: usize) -> Self {
        self.max_symlinks = max_symlinks;
        self
    }

    /// Resolve a path that must exist.
    ///
    /// # Errors
    ///
    /// - [`CopyError::NotFound`] if nothing backs the final component
    /// - [`CopyError::SymlinkLoop`] if too many symlinks were followed
    /// - [`CopyError::PermissionDenied`] if the host refuses a lookup
    pub fn resolve(&self, requested: &str) -> Result<ResolvedPath> {
        let resolved = self.resolve_lenient(requested)?;
        match std::fs::symlink_metadata(resolved.real.as_path()) {
            Ok(_) => Ok(resolved),
            Err(e) => Err(self.lookup_error(e, &resolved.container)),
        }
    }

    /// Resolve a path that is about to be written.
    ///
    /// The final component may be missing, but its parent must resolve to an
    /// existing directory.
    pub fn resolve_for_write(&self, requested: &str) -> Result<ResolvedPath> {
        let resolved = self.resolve_lenient(requested)?;
        match std::fs::symlink_metadata(resolved.real.as_path()) {
            Ok(_) => return Ok(resolved),
            Err(e) if !is_missing(&e) => return Err(self.lookup_error(e, &resolved.container)),
            Err(_) => {}
        }

        // Only `/` has no parent, and the root always exists.
        let Some(parent) = resolved.container.parent() else {
            return Err(CopyError::NotFound(resolved.container.to_string()));
        };
        let (parent_real, _) = self.mounts.host_path_for(self.root, &parent);
        match std::fs::metadata(parent_real.as_path()) {
            Ok(m) if m.is_dir() => Ok(resolved),
            Ok(_) => Err(CopyError::NotFound(format!(
                "{} is not a directory",
                parent
            ))),
            Err(e) => Err(self.lookup_error(e, &parent)),
        }
    }

    /// Walk `requested` and map the result to host storage, without
    /// checking that the final component exists.
    fn resolve_lenient(&self, requested: &str) -> Result<ResolvedPath> {
        let container = self.walk(requested)?;
        let (real, via_mount) = self.mounts.host_path_for(self.root, &container);

        let contained = match via_mount {
            Some(mount) => real.as_path().starts_with(mount.host_path.as_path()),
            None => self.root.contains(&real),
        };
        if !contained {
            return Err(CopyError::EscapeAttempt(requested.to_string()));
        }

        tracing::debug!(
            "resolved {:?} -> {} ({}{})",
            requested,
            container,
            real,
            via_mount
                .map(|m| format!(", via {} mount {}", m.kind, m.container_path))
                .unwrap_or_default()
        );

        Ok(ResolvedPath {
            requested: requested.to_string(),
            container,
            real,
            via_mount: via_mount.cloned(),
        })
    }

    /// The symlink-free container path `requested` refers to.
    fn walk(&self, requested: &str) -> Result<ContainerPath> {
        validate_raw(requested)?;

        let mut pending: VecDeque<String> = raw_components(requested).map(String::from).collect();
        let mut resolved: Vec<String> = Vec::new();
        let mut links = 0usize;

        while let Some(component) = pending.pop_front() {
            if component == ".." {
                // No-op at the root.
                resolved.pop();
                continue;
            }

            resolved.push(component);
            let current = ContainerPath::from_components(resolved.clone());
            if self.mounts.is_mount_point(&current) {
                continue;
            }

            let (real, _) = self.mounts.host_path_for(self.root, &current);
            let metadata = match std::fs::symlink_metadata(real.as_path()) {
                Ok(metadata) => metadata,
                // Missing intermediates are judged once the walk is done.
                Err(e) if is_missing(&e) => continue,
                Err(e) => return Err(self.lookup_error(e, &current)),
            };
            if !metadata.file_type().is_symlink() {
                continue;
            }

            links += 1;
            if links > self.max_symlinks {
                return Err(CopyError::SymlinkLoop(requested.to_string()));
            }

            let target = std::fs::read_link(real.as_path())
                .map_err(|e| self.lookup_error(e, &current))?;
            let target = target.to_str().ok_or_else(|| {
                CopyError::InvalidPath(format!("symlink target of {} is not UTF-8", current))
            })?;
            tracing::trace!("following symlink {} -> {}", current, target);

            resolved.pop();
            if target.starts_with('/') {
                resolved.clear();
            }
            for component in raw_components(target).rev() {
                pending.push_front(component.to_string());
            }
        }

        Ok(ContainerPath::from_components(resolved))
    }

    /// Map a host lookup failure to an error phrased in container terms.
    fn lookup_error(&self, err: io::Error, path: &ContainerPath) -> CopyError {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                CopyError::NotFound(path.to_string())
            }
            io::ErrorKind::PermissionDenied => CopyError::PermissionDenied(path.to_string()),
            kind => CopyError::Io(io::Error::new(kind, format!("{}: {}", path, err))),
        }
    }
}

fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

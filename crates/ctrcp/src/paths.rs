//! Typed path spaces.
//!
//! A path as seen *inside* a container and a path on the host are different
//! things even though both are strings. Mixing them up is how copy tools end
//! up reading host files, so they get separate types here:
//!
//! - [`ContainerPath`]: a normalized, absolute, `/`-separated path inside a
//!   container. It never contains `.`, `..` or empty components.
//! - [`HostPath`]: a concrete path on the host filesystem.
//! - [`ContainerRoot`]: the host directory serving as a container's `/`.
//!
//! Only the resolver turns a [`ContainerPath`] into a [`HostPath`].

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CopyError, Result};

/// Split a raw path string into its meaningful components.
///
/// Empty components (from `//` or a leading `/`) and `.` are dropped; `..` is
/// kept for the caller to interpret.
pub(crate) fn raw_components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

/// Reject strings that cannot name a file on a POSIX system.
pub(crate) fn validate_raw(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(CopyError::InvalidPath(format!(
            "path contains null byte: {:?}",
            path
        )));
    }
    if path.len() > libc::PATH_MAX as usize {
        return Err(CopyError::InvalidPath(format!(
            "path exceeds PATH_MAX ({} bytes)",
            libc::PATH_MAX
        )));
    }
    Ok(())
}

/// A normalized absolute path inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerPath {
    components: Vec<String>,
}

impl ContainerPath {
    /// The container's `/`.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Normalize `path` lexically as if rooted at `/`.
    ///
    /// A missing leading slash makes no difference, and `..` at the root is a
    /// no-op, so `../../etc` and `etc` both become `/etc`.
    pub fn parse(path: &str) -> Result<Self> {
        validate_raw(path)?;
        let mut components: Vec<String> = Vec::new();
        for component in raw_components(path) {
            if component == ".." {
                components.pop();
            } else {
                components.push(component.to_string());
            }
        }
        Ok(Self { components })
    }

    pub(crate) fn from_components(components: Vec<String>) -> Self {
        debug_assert!(
            components
                .iter()
                .all(|c| !c.is_empty() && c != "." && c != ".." && !c.contains('/'))
        );
        Self { components }
    }

    /// Whether this is the container's `/`.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// The path components, outermost first.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The last component, or `None` for `/`.
    pub fn file_name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// The containing directory, or `None` for `/`.
    pub fn parent(&self) -> Option<ContainerPath> {
        if self.is_root() {
            return None;
        }
        let mut components = self.components.clone();
        components.pop();
        Some(Self { components })
    }

    /// Component-wise prefix test: `/foo` is a prefix of `/foo/bar` but not of `/foobar`.
    pub fn starts_with(&self, prefix: &ContainerPath) -> bool {
        self.components.starts_with(&prefix.components)
    }

    /// The components left after removing `prefix`, if it is one.
    pub fn strip_prefix(&self, prefix: &ContainerPath) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.components[prefix.components.len()..])
        } else {
            None
        }
    }

    /// Number of components; `/` has depth zero.
    pub fn depth(&self) -> usize {
        self.components.len()
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

/// A concrete path on the host filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPath(PathBuf);

impl HostPath {
    /// Wrap a host path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Borrow as a std path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Append already validated container components.
    pub(crate) fn join_components<'a>(&self, components: impl IntoIterator<Item = &'a String>) -> Self {
        let mut path = self.0.clone();
        for component in components {
            path.push(component);
        }
        Self(path)
    }
}

impl AsRef<Path> for HostPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

/// The host directory that is a container's `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRoot(HostPath);

impl ContainerRoot {
    /// Wrap a container root; the path must be absolute.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(CopyError::InvalidMetadata(format!(
                "container root must be absolute: {}",
                path.display()
            )));
        }
        Ok(Self(HostPath::new(path)))
    }

    /// Map a container path onto the root without consulting mounts.
    pub(crate) fn join(&self, path: &ContainerPath) -> HostPath {
        self.0.join_components(path.components())
    }

    /// Lexical containment check.
    pub fn contains(&self, path: &HostPath) -> bool {
        path.as_path().starts_with(self.0.as_path())
    }
}

//! Error types for the ctrcp library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, CopyError>`. The orchestrator wraps component errors in a
//! [`TransferError`] that records which stage failed without altering the
//! underlying [`CopyError`].
//!
//! # Error Categories
//!
//! - **Lookup errors**: [`NotFound`], [`AmbiguousReference`], [`AmbiguousEndpoint`]
//! - **Resolution errors**: [`SymlinkLoop`], [`EscapeAttempt`]
//! - **Host errors**: [`PermissionDenied`], [`Io`]
//! - **Input errors**: [`InvalidPath`], [`InvalidMetadata`], [`JsonParse`], [`Config`]
//!
//! Path escapes are not in this list on purpose: excess `..` components and
//! absolute symlink targets are clamped to the container root instead of
//! being reported. [`EscapeAttempt`] only fires if that clamping invariant
//! is ever violated.
//!
//! [`NotFound`]: CopyError::NotFound
//! [`AmbiguousReference`]: CopyError::AmbiguousReference
//! [`AmbiguousEndpoint`]: CopyError::AmbiguousEndpoint
//! [`SymlinkLoop`]: CopyError::SymlinkLoop
//! [`EscapeAttempt`]: CopyError::EscapeAttempt
//! [`PermissionDenied`]: CopyError::PermissionDenied
//! [`Io`]: CopyError::Io
//! [`InvalidPath`]: CopyError::InvalidPath
//! [`InvalidMetadata`]: CopyError::InvalidMetadata
//! [`JsonParse`]: CopyError::JsonParse
//! [`Config`]: CopyError::Config
//!
//! # Conversion
//!
//! `std::io::Error` converts into [`CopyError::Io`] through `From`, which keeps
//! `?` usable everywhere. Call sites that know which path they touched use
//! [`CopyError::from_io`] instead, so that "not found" and "permission denied"
//! surface as their own variants with the offending path in the message.

use std::fmt;
use std::io;
use std::path::Path;

/// Result type alias for operations that may return a CopyError.
pub type Result<T> = std::result::Result<T, CopyError>;

/// Error types for copy operations.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// A container, container path or host path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Zero or two container references were given for a copy.
    #[error("ambiguous endpoints: {0}")]
    AmbiguousEndpoint(String),

    /// A container reference matched more than one container.
    #[error("ambiguous container reference: {0}")]
    AmbiguousReference(String),

    /// Symlink resolution exceeded the indirection limit.
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),

    /// A resolved path ended up outside the container root.
    #[error("resolved path escapes the container root: {0}")]
    EscapeAttempt(String),

    /// The host filesystem denied access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A path or archive entry name is not acceptable.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Container metadata is malformed.
    #[error("invalid container metadata: {0}")]
    InvalidMetadata(String),

    /// I/O error while reading or writing the host filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing error in container metadata.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl CopyError {
    /// Convert an I/O error raised while touching `path`.
    ///
    /// `NotFound`, `NotADirectory` and `PermissionDenied` are lifted into the
    /// matching variants; anything else stays an [`CopyError::Io`].
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                CopyError::NotFound(path.display().to_string())
            }
            io::ErrorKind::PermissionDenied => {
                CopyError::PermissionDenied(path.display().to_string())
            }
            _ => CopyError::Io(io::Error::new(
                err.kind(),
                format!("{}: {}", path.display(), err),
            )),
        }
    }

    /// Whether this error is a broken pipe, i.e. the other pipeline stage went away.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, CopyError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }
}

/// Pipeline stage in which a transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Parsing the copy endpoints.
    Parse,
    /// Looking up the container in the store.
    Lookup,
    /// Resolving the in-container path.
    Resolve,
    /// Producing the archive stream.
    Archive,
    /// Consuming the archive stream.
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::Lookup => "lookup",
            Stage::Resolve => "resolve",
            Stage::Archive => "archive",
            Stage::Extract => "extract",
        };
        f.write_str(name)
    }
}

/// A component error tagged with the stage that produced it.
#[derive(Debug, thiserror::Error)]
#[error("{stage}: {error}")]
pub struct TransferError {
    /// The failing stage.
    pub stage: Stage,
    /// The component's error, unchanged.
    #[source]
    pub error: CopyError,
}

impl TransferError {
    pub(crate) fn new(stage: Stage, error: CopyError) -> Self {
        Self { stage, error }
    }

    /// Borrow the underlying error.
    pub fn kind(&self) -> &CopyError {
        &self.error
    }
}

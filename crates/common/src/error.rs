//! Error types for the lazy filesystem core

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the core
pub type Result<T> = std::result::Result<T, LazyFsError>;

/// Everything a mount, its resolver or its broker can fail with
#[derive(Debug, Error)]
pub enum LazyFsError {
    /// Missing, non-directory or mis-owned cache root. Fatal at mount time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A helper already holds the control channel
    #[error("control channel already in use")]
    AlreadyInUse,

    /// The helper rejected the path, or the parent index does not declare it
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Opened something that has no byte content (control file, symlink)
    #[error("not a regular file: {0}")]
    NotAFile(String),

    /// A second mapping would alias a different physical generation
    #[error("mapping conflict on {path}: backing file was replaced while still mapped")]
    MappingConflict { path: String },

    /// The helper did not complete a request within the configured bound
    #[error("request for {0} timed out")]
    Timeout(String),

    #[error("invalid directory index at {path}: {reason}")]
    InvalidIndex { path: PathBuf, reason: String },

    /// The cache holds an entry of a different kind than its index declares
    #[error("cache entry for {0} has the wrong type")]
    KindMismatch(String),

    /// The control channel handle was used after the helper detached
    #[error("helper detached")]
    Detached,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

impl LazyFsError {
    pub(crate) fn invalid_index(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidIndex {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that mean "this path does not exist"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Map to the errno a filesystem client should observe
    pub fn errno(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::ConfigFile(_) => libc::EINVAL,
            Self::AlreadyInUse | Self::MappingConflict { .. } => libc::EBUSY,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::NotAFile(_) => libc::EINVAL,
            Self::Timeout(_) => libc::ETIMEDOUT,
            Self::InvalidIndex { .. } | Self::KindMismatch(_) | Self::Detached => libc::EIO,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

//! Storage and archive error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while building, measuring or clearing a tree.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Storage root for the key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Storage root does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key or path cannot be used as a storage location.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A walk was cancelled or ran past its deadline.
    #[error("storage walk cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from snapshot and restore.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Current usage exceeds the archive ceiling.
    #[error("storage usage of {usage} bytes exceeds the archive ceiling of {ceiling} bytes")]
    TooLarge { usage: u64, ceiling: u64 },

    /// Archive is empty, unreadable or fails validation.
    #[error("invalid archive: {0}")]
    Invalid(String),

    /// Archive file does not exist.
    #[error("archive not found: {0}")]
    NotFound(String),

    /// The operation was cancelled or timed out. Nothing was changed.
    #[error("archive operation cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(error: zip::result::ZipError) -> Self {
        match error {
            zip::result::ZipError::Io(e) => ArchiveError::Io(e),
            other => ArchiveError::Invalid(other.to_string()),
        }
    }
}

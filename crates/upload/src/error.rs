//! Upload orchestration errors.

use splice_metadata::MetadataError;
use splice_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by strategies and the orchestrator.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Malformed request or a part whose checksum does not match.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("upload not found: {0}")]
    NotFound(Uuid),

    #[error("upload {upload_id} is {state}")]
    InvalidState { upload_id: Uuid, state: String },

    /// A range lock was held elsewhere; retry after backoff.
    #[error("upload {0} is busy composing parts")]
    LockContention(Uuid),

    #[error("upload {upload_id} is incomplete: {reason}")]
    IncompleteUpload { upload_id: Uuid, reason: String },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl UploadError {
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention(_))
    }

    /// True for absent sessions, including persistence-level not-found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Metadata(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<splice_core::Error> for UploadError {
    fn from(err: splice_core::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Result type for upload operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;

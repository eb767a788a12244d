//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A transaction-scoped query ran after its transaction finished.
    #[error("no active transaction")]
    NoTransaction,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetadataError {
    /// Translate constraint failures on a write into domain errors.
    ///
    /// Foreign-key failures mean the parent session is gone, so they surface
    /// as `NotFound` rather than a raw database error.
    pub(crate) fn on_write(err: sqlx::Error, what: impl Into<String>) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_foreign_key_violation() {
                return Self::NotFound(what.into());
            }
            if db_err.is_unique_violation() {
                return Self::AlreadyExists(what.into());
            }
        }
        Self::Database(err)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<splice_core::Error> for MetadataError {
    fn from(err: splice_core::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),

    #[error("invalid part range: {0}")]
    InvalidPartRange(String),

    #[error("invalid part number {part_number}: must be between 1 and {total_parts}")]
    InvalidPartNumber { part_number: u32, total_parts: u32 },

    #[error("invalid part size: {size} (must be between {min} and {max})")]
    InvalidPartSize { size: u64, min: u64, max: u64 },

    #[error("too many parts: {parts} (max {max})")]
    TooManyParts { parts: u64, max: u64 },

    #[error("invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("unknown value for {field}: {value}")]
    UnknownVariant { field: &'static str, value: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Core domain types and shared logic for splice multipart uploads.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload requests, session identifiers and status
//! - Part ranges and contiguous pairs
//! - Object key conventions for parts and composed ranges
//! - Injectable clock and id sources
//! - Configuration

pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod range;
pub mod upload;

pub use clock::{Clock, IdGenerator, ManualClock, RandomIdGenerator, SequentialIdGenerator, SystemClock};
pub use error::{Error, Result};
pub use range::{ContiguousPair, PartRange, RangeOrder};
pub use upload::{
    FinalObjectDescriptor, PartLimits, PresignedPart, SourceObject, StrategyKind, UploadId,
    UploadRequest, UploadState, UploadStatus,
};

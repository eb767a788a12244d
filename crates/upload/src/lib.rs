//! Multipart upload orchestration for splice.
//!
//! This crate provides:
//! - The [`ComposeStrategy`] interface chosen per upload at initiation
//! - [`NativeStrategy`], a pass-through to provider multipart uploads
//! - [`MergeTreeStrategy`], pairwise composition for compose-only providers
//! - [`UploadOrchestrator`], the initiate / add part / complete / abort facade

pub mod error;
pub mod merge_tree;
pub mod native;
pub mod orchestrator;
pub mod retry;
pub mod strategy;

pub use error::{UploadError, UploadResult};
pub use merge_tree::MergeTreeStrategy;
pub use native::NativeStrategy;
pub use orchestrator::UploadOrchestrator;
pub use retry::retry_on_contention;
pub use strategy::{ComposeStrategy, UploadTarget};

//! Repository traits for metadata operations.

pub mod ranges;
pub mod sessions;

pub use ranges::{PartRangeStore, RangeTransaction};
pub use sessions::UploadSessionStore;

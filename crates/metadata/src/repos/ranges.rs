//! Part range repository.

use crate::error::MetadataResult;
use crate::lock::RangeLockTable;
use async_trait::async_trait;
use splice_core::{ContiguousPair, PartRange, RangeOrder};
use uuid::Uuid;

/// Repository for the ranges of a merge-tree upload.
///
/// Callers guarantee that added ranges are disjoint from existing ones; the
/// store does not split or merge rows itself.
#[async_trait]
pub trait PartRangeStore: Send + Sync {
    /// Insert a range. Adding an existing range again is a no-op.
    async fn add_range(&self, upload_id: Uuid, range: PartRange) -> MetadataResult<()>;

    /// Delete the row exactly matching `range`. Returns false when no such
    /// row exists, including when `range` only overlaps one.
    async fn remove_range(&self, upload_id: Uuid, range: PartRange) -> MetadataResult<bool>;

    /// Up to `limit` pairs where `left.upper + 1 == right.lower`.
    async fn find_contiguous_pairs(
        &self,
        upload_id: Uuid,
        order: RangeOrder,
        limit: u32,
    ) -> MetadataResult<Vec<ContiguousPair>>;

    /// Every range of the upload, lowest bound first.
    async fn list_ranges(&self, upload_id: Uuid) -> MetadataResult<Vec<PartRange>>;

    /// Open a transaction for a read-then-act range mutation.
    async fn begin_ranges(&self) -> MetadataResult<Box<dyn RangeTransaction>>;

    /// Ranges lying entirely inside `[lower, upper]`, read through `tx`.
    async fn ranges_in_bounds(
        &self,
        tx: &mut dyn RangeTransaction,
        upload_id: Uuid,
        lower: u32,
        upper: u32,
    ) -> MetadataResult<Vec<PartRange>> {
        tx.ranges_in_bounds(upload_id, lower, upper).await
    }

    /// Advisory locks guarding compose and delete critical sections.
    fn range_locks(&self) -> &RangeLockTable;
}

/// A transaction over the range table.
///
/// Once committed or rolled back, every further call fails with
/// [`MetadataError::NoTransaction`](crate::MetadataError::NoTransaction).
#[async_trait]
pub trait RangeTransaction: Send {
    async fn ranges_in_bounds(
        &mut self,
        upload_id: Uuid,
        lower: u32,
        upper: u32,
    ) -> MetadataResult<Vec<PartRange>>;

    async fn add_range(&mut self, upload_id: Uuid, range: PartRange) -> MetadataResult<()>;

    async fn remove_range(&mut self, upload_id: Uuid, range: PartRange) -> MetadataResult<bool>;

    async fn commit(&mut self) -> MetadataResult<()>;

    async fn rollback(&mut self) -> MetadataResult<()>;
}

//! Multipart assembly on providers whose only merge primitive is compose.
//!
//! Every uploaded part and every merge result is one object, and the range
//! table is the single record of which spans exist. Merges are always
//! pairwise: two adjacent ranges `[a, b]` and `[b + 1, c]` are composed into
//! `[a, c]` under the advisory locks of both source ranges. `add_part` makes a
//! bounded number of opportunistic merges and never fails because of one;
//! `complete` drains the remaining pairs in ascending order and fails fast if
//! another caller holds a lock.
//!
//! The compose call happens before the range rows change, so a crash leaves
//! either the pre-merge rows (safe to redo) or the post-merge rows with an
//! orphaned source object.

use crate::error::{UploadError, UploadResult};
use crate::strategy::{
    ComposeStrategy, UploadTarget, delete_best_effort, sweep_objects, verify_part,
};
use async_trait::async_trait;
use splice_core::keys::{part_key, range_key};
use splice_core::{ContiguousPair, PartRange, RangeOrder, StrategyKind};
use splice_metadata::MetadataStore;
use splice_storage::{ObjectStore, StorageError};
use std::sync::Arc;
use tracing::instrument;

/// Merge attempts made by each `add_part` when none is configured.
pub const DEFAULT_MERGE_ATTEMPTS: u32 = 4;

/// Outcome of one locked merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Merge {
    Merged,
    /// One of the source ranges was merged or removed by someone else.
    Stale,
}

pub struct MergeTreeStrategy {
    store: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    merge_attempts: u32,
}

impl MergeTreeStrategy {
    pub fn new(store: Arc<dyn MetadataStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            objects,
            merge_attempts: DEFAULT_MERGE_ATTEMPTS,
        }
    }

    /// Number of contiguous pairs `add_part` tries to merge.
    pub fn with_merge_attempts(mut self, attempts: u32) -> Self {
        self.merge_attempts = attempts;
        self
    }

    /// Compose `pair` into one object and swap the range rows.
    ///
    /// Callers must hold the locks of both source ranges. The compose call
    /// runs outside any metadata transaction; the rows are re-checked and
    /// swapped in a short transaction afterwards.
    async fn merge_locked(&self, target: &UploadTarget, pair: ContiguousPair) -> UploadResult<Merge> {
        let upload_id = target.upload_id;
        let merged = pair.merged();
        let base = target.parts_base();
        let left_key = range_key(&base, &pair.left);
        let right_key = range_key(&base, &pair.right);
        let merged_key = range_key(&base, &merged);

        let present = self.store.list_ranges(upload_id).await?;
        if !present.contains(&pair.left) || !present.contains(&pair.right) {
            return Ok(Merge::Stale);
        }

        self.objects
            .compose(
                &target.bucket,
                &merged_key,
                &[left_key.clone(), right_key.clone()],
            )
            .await?;

        // Dropping `tx` before commit rolls back.
        let mut tx = self.store.begin_ranges().await?;
        let present = self
            .store
            .ranges_in_bounds(tx.as_mut(), upload_id, merged.lower(), merged.upper())
            .await?;
        if !present.contains(&pair.left) || !present.contains(&pair.right) {
            tx.rollback().await?;
            if !present.contains(&merged) {
                delete_best_effort(self.objects.as_ref(), upload_id, &target.bucket, &merged_key)
                    .await;
            }
            return Ok(Merge::Stale);
        }
        tx.add_range(upload_id, merged).await?;
        tx.remove_range(upload_id, pair.left).await?;
        tx.remove_range(upload_id, pair.right).await?;
        tx.commit().await?;

        tracing::debug!(
            upload_id = %upload_id,
            left = %pair.left,
            right = %pair.right,
            "Merged part ranges"
        );

        delete_best_effort(self.objects.as_ref(), upload_id, &target.bucket, &left_key).await;
        delete_best_effort(self.objects.as_ref(), upload_id, &target.bucket, &right_key).await;
        Ok(Merge::Merged)
    }

    /// Try-lock and merge `pair`. `None` when a lock was busy.
    async fn try_merge(
        &self,
        target: &UploadTarget,
        pair: ContiguousPair,
    ) -> Option<UploadResult<Merge>> {
        self.store
            .range_locks()
            .attempt_lock_and_run(target.upload_id, &[pair.left, pair.right], move || async move {
                self.merge_locked(target, pair).await
            })
            .await
    }

    /// Opportunistic merging after a part arrives. Never fails.
    async fn reduce(&self, target: &UploadTarget) {
        let upload_id = target.upload_id;
        let pairs = match self
            .store
            .find_contiguous_pairs(upload_id, RangeOrder::Random, self.merge_attempts)
            .await
        {
            Ok(pairs) => pairs,
            Err(e) => {
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %e,
                    "Failed to look up mergeable ranges"
                );
                return;
            }
        };

        for pair in pairs {
            match self.try_merge(target, pair).await {
                Some(Ok(Merge::Merged)) => {}
                Some(Ok(Merge::Stale)) => {
                    tracing::debug!(
                        upload_id = %upload_id,
                        left = %pair.left,
                        right = %pair.right,
                        "Ranges changed; merge skipped"
                    );
                }
                None => {
                    tracing::debug!(
                        upload_id = %upload_id,
                        left = %pair.left,
                        right = %pair.right,
                        "Ranges locked; merge skipped"
                    );
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        upload_id = %upload_id,
                        left = %pair.left,
                        right = %pair.right,
                        error = %e,
                        "Opportunistic merge failed; completion will retry it"
                    );
                }
            }
        }
    }

    /// Whether part `part_number` is already inside a stored range.
    async fn is_covered(&self, target: &UploadTarget, part_number: u32) -> UploadResult<bool> {
        let ranges = self.store.list_ranges(target.upload_id).await?;
        Ok(ranges
            .iter()
            .any(|r| (r.lower()..=r.upper()).contains(&part_number)))
    }
}

#[async_trait]
impl ComposeStrategy for MergeTreeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MergeTree
    }

    async fn allocate(
        &self,
        _bucket: &str,
        _key: &str,
        _content_type: Option<&str>,
    ) -> UploadResult<String> {
        Ok(String::new())
    }

    #[instrument(skip(self, target), fields(upload_id = %target.upload_id, strategy = "merge_tree"))]
    async fn add_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        part_md5: &str,
    ) -> UploadResult<()> {
        let key = part_key(&target.parts_base(), part_number);
        if self.is_covered(target, part_number).await? {
            // The part object may already be merged away; check against the
            // recorded checksum instead, and never add an overlapping range.
            let recorded = self
                .store
                .list_parts(target.upload_id)
                .await?
                .into_iter()
                .find(|p| p.part_number == i64::from(part_number));
            match recorded {
                Some(p) if p.part_md5.eq_ignore_ascii_case(part_md5) => {}
                Some(_) => {
                    return Err(UploadError::Validation(format!(
                        "part {part_number} was already accepted with a different MD5"
                    )));
                }
                None => {
                    verify_part(self.objects.as_ref(), &target.bucket, &key, part_md5).await?;
                }
            }
            tracing::debug!(upload_id = %target.upload_id, part_number, "Part already accepted");
            return Ok(());
        }

        verify_part(self.objects.as_ref(), &target.bucket, &key, part_md5).await?;

        let range = PartRange::single(part_number)?;
        self.store.add_range(target.upload_id, range).await?;
        self.reduce(target).await;
        Ok(())
    }

    #[instrument(skip(self, target), fields(upload_id = %target.upload_id, strategy = "merge_tree"))]
    async fn complete(&self, target: &UploadTarget) -> UploadResult<u64> {
        let upload_id = target.upload_id;
        let full = PartRange::new(1, target.total_parts)?;
        let incomplete = |reason: String| UploadError::IncompleteUpload { upload_id, reason };

        let mut merges = 0;
        loop {
            let ranges = self.store.list_ranges(upload_id).await?;
            if ranges == [full] {
                break;
            }
            if ranges.is_empty()
                && let Some(meta) = self.objects.exists(&target.bucket, &target.key).await?
            {
                // An earlier attempt finalized but the session was never marked.
                tracing::info!(upload_id = %upload_id, size = meta.size, "Upload already assembled");
                return Ok(meta.size);
            }
            if merges >= target.total_parts.saturating_sub(1) {
                return Err(incomplete(format!(
                    "{} ranges remain after {merges} merges",
                    ranges.len()
                )));
            }
            let pair = self
                .store
                .find_contiguous_pairs(upload_id, RangeOrder::Ascending, 1)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| incomplete(format!("no adjacent ranges among {} ranges", ranges.len())))?;

            match self.try_merge(target, pair).await {
                Some(Ok(Merge::Merged)) => merges += 1,
                Some(Ok(Merge::Stale)) | None => return Err(UploadError::LockContention(upload_id)),
                Some(Err(e)) => return Err(e),
            }
        }

        let source_key = range_key(&target.parts_base(), &full);
        let finalized = self
            .store
            .range_locks()
            .attempt_lock_and_run(upload_id, &[full], move || async move {
                if let Err(e) = self
                    .objects
                    .rename(&target.bucket, &source_key, &target.key)
                    .await
                {
                    // Renamed by an attempt that stopped before removing the row.
                    let renamed = matches!(e, StorageError::NotFound(_))
                        && self.objects.exists(&target.bucket, &target.key).await?.is_some();
                    if !renamed {
                        return Err(e.into());
                    }
                }
                self.store.remove_range(upload_id, full).await?;
                UploadResult::Ok(())
            })
            .await;
        match finalized {
            Some(result) => result?,
            None => return Err(UploadError::LockContention(upload_id)),
        }

        let size = self.objects.head(&target.bucket, &target.key).await?.size;
        tracing::info!(upload_id = %upload_id, size, "Assembled merge-tree upload");
        Ok(size)
    }

    #[instrument(skip(self, target), fields(upload_id = %target.upload_id, strategy = "merge_tree"))]
    async fn abort(&self, target: &UploadTarget) -> UploadResult<()> {
        let upload_id = target.upload_id;
        let base = target.parts_base();

        for range in self.store.list_ranges(upload_id).await? {
            let key = range_key(&base, &range);
            let removed = self
                .store
                .range_locks()
                .attempt_lock_and_run(upload_id, &[range], move || async move {
                    self.store.remove_range(upload_id, range).await?;
                    delete_best_effort(self.objects.as_ref(), upload_id, &target.bucket, &key).await;
                    UploadResult::Ok(())
                })
                .await;
            match removed {
                Some(result) => result?,
                None => return Err(UploadError::LockContention(upload_id)),
            }
        }

        sweep_objects(self.objects.as_ref(), target).await;
        Ok(())
    }
}

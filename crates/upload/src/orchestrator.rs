//! Public entry points for multipart uploads.

use crate::error::{UploadError, UploadResult};
use crate::merge_tree::MergeTreeStrategy;
use crate::native::NativeStrategy;
use crate::strategy::{ComposeStrategy, UploadTarget};
use splice_core::config::UploadConfig;
use splice_core::keys::destination_key;
use splice_core::{
    FinalObjectDescriptor, IdGenerator, PartRange, PresignedPart, RandomIdGenerator,
    StrategyKind, UploadId, UploadRequest, UploadState, UploadStatus,
};
use splice_metadata::MetadataStore;
use splice_metadata::models::{NewUploadSession, UploadSessionRow};
use splice_storage::ObjectStore;
use std::sync::Arc;
use tracing::instrument;

/// Drives upload sessions and dispatches part work to the session's strategy.
pub struct UploadOrchestrator {
    store: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    ids: Arc<dyn IdGenerator>,
    config: UploadConfig,
    native: NativeStrategy,
    merge_tree: MergeTreeStrategy,
}

impl UploadOrchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        config: UploadConfig,
    ) -> Self {
        let native = NativeStrategy::new(store.clone(), objects.clone());
        let merge_tree = MergeTreeStrategy::new(store.clone(), objects.clone())
            .with_merge_attempts(config.merge_attempts_per_part);
        Self {
            store,
            objects,
            ids: Arc::new(RandomIdGenerator),
            config,
            native,
            merge_tree,
        }
    }

    /// Use `ids` when minting destination keys.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    fn strategy(&self, kind: StrategyKind) -> &dyn ComposeStrategy {
        match kind {
            StrategyKind::Native => &self.native,
            StrategyKind::MergeTree => &self.merge_tree,
        }
    }

    async fn load(&self, upload_id: UploadId) -> UploadResult<UploadSessionRow> {
        self.store
            .get_session(*upload_id.as_uuid())
            .await?
            .ok_or(UploadError::NotFound(*upload_id.as_uuid()))
    }

    async fn load_uploading(&self, upload_id: UploadId) -> UploadResult<UploadSessionRow> {
        let session = self.load(upload_id).await?;
        match session.state()? {
            UploadState::Uploading => Ok(session),
            state => Err(UploadError::InvalidState {
                upload_id: session.upload_id,
                state: state.to_string(),
            }),
        }
    }

    async fn status_of(&self, session: &UploadSessionRow) -> UploadResult<UploadStatus> {
        let total_parts = session.total_parts()?;
        let bitmap = match session.state()? {
            // Part rows are cleared on completion.
            UploadState::Completed => "1".repeat(total_parts as usize),
            UploadState::Uploading => {
                self.store
                    .parts_bitmap(session.upload_id, total_parts)
                    .await?
            }
        };
        Ok(session.to_status(bitmap)?)
    }

    /// Start an upload, or return the session already uploading the same
    /// request for this owner.
    ///
    /// With `force_restart`, an existing session for the request is aborted
    /// first and a fresh one is created.
    #[instrument(skip(self, request), fields(owner_id = %owner_id, file_name = %request.file_name))]
    pub async fn initiate(
        &self,
        owner_id: &str,
        request: &UploadRequest,
        force_restart: bool,
    ) -> UploadResult<UploadStatus> {
        if owner_id.trim().is_empty() {
            return Err(UploadError::Validation("owner id is required".to_string()));
        }
        request.validate(&self.config.part_limits())?;
        let request_hash = request.request_hash()?;

        if let Some(existing) = self
            .store
            .get_session_by_owner_and_hash(owner_id, &request_hash)
            .await?
        {
            if !force_restart {
                return self.status_of(&existing).await;
            }
            tracing::info!(upload_id = %existing.upload_id, "Restarting upload");
            self.abort_session(&existing).await?;
        }

        let kind = request.strategy.unwrap_or(self.config.default_strategy);
        if kind == StrategyKind::Native && !self.native.is_supported() {
            return Err(UploadError::Validation(format!(
                "{} storage does not support native multipart uploads",
                self.objects.backend_name()
            )));
        }
        let total_parts = u32::try_from(request.part_count()).map_err(|_| {
            UploadError::Validation(format!("{} parts is too many", request.part_count()))
        })?;

        let strategy = self.strategy(kind);
        let bucket = self.config.bucket.clone();
        let key = destination_key(owner_id, self.ids.next_id(), &request.file_name);
        let token = strategy
            .allocate(&bucket, &key, request.content_type.as_deref())
            .await?;

        let created = self
            .store
            .create_session(&NewUploadSession {
                owner_id: owner_id.to_string(),
                request_hash,
                request_body: request.canonical_json()?,
                strategy: kind,
                bucket: bucket.clone(),
                object_key: key.clone(),
                upload_token: token.clone(),
                total_parts,
                part_size: request.part_size_bytes,
                source_object_id: request.source.as_ref().map(|s| s.object_id.clone()),
                source_etag: request.source.as_ref().and_then(|s| s.etag.clone()),
            })
            .await;

        let session = match created {
            Ok(session) => session,
            Err(e) => {
                self.discard(strategy, &bucket, &key, &token).await;
                return Err(e.into());
            }
        };
        if session.object_key != key {
            // Lost a race with an identical initiate; keep the winner.
            self.discard(strategy, &bucket, &key, &token).await;
        } else {
            tracing::info!(
                upload_id = %session.upload_id,
                strategy = %kind,
                total_parts,
                "Upload initiated"
            );
        }
        self.status_of(&session).await
    }

    async fn discard(
        &self,
        strategy: &dyn ComposeStrategy,
        bucket: &str,
        key: &str,
        token: &str,
    ) {
        if let Err(e) = strategy.discard_allocation(bucket, key, token).await {
            tracing::warn!(key = %key, error = %e, "Failed to discard unused upload allocation");
        }
    }

    /// Accept part `part_number`, already uploaded to its part key.
    ///
    /// Re-adding a part with the same MD5 is a no-op. Failures are recorded
    /// against the part before being returned.
    #[instrument(skip(self, part_md5), fields(upload_id = %upload_id))]
    pub async fn add_part(
        &self,
        upload_id: UploadId,
        part_number: u32,
        part_md5: &str,
    ) -> UploadResult<()> {
        let session = self.load_uploading(upload_id).await?;
        let target = UploadTarget::from_session(&session)?;
        validate_part_number(part_number, target.total_parts)?;
        if part_md5.trim().is_empty() {
            return Err(UploadError::Validation("part MD5 is required".to_string()));
        }

        let already_added = self
            .store
            .list_parts(target.upload_id)
            .await?
            .iter()
            .any(|p| {
                p.part_number == i64::from(part_number) && p.part_md5.eq_ignore_ascii_case(part_md5)
            });
        if already_added {
            return Ok(());
        }

        let strategy = self.strategy(session.strategy()?);
        match strategy.add_part(&target, part_number, part_md5).await {
            Ok(()) => {
                self.store
                    .record_part_success(target.upload_id, part_number, part_md5)
                    .await?;
                Ok(())
            }
            Err(e) => {
                if let Err(record_err) = self
                    .store
                    .record_part_failure(target.upload_id, part_number, &e.to_string())
                    .await
                {
                    tracing::warn!(
                        upload_id = %target.upload_id,
                        part_number,
                        error = %record_err,
                        "Failed to record part failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Assemble the final object once every part has been added.
    ///
    /// Completing a completed upload returns the stored result.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn complete(&self, upload_id: UploadId) -> UploadResult<FinalObjectDescriptor> {
        let session = self.load(upload_id).await?;
        if session.state()? == UploadState::Completed {
            return session.final_object().ok_or_else(|| UploadError::InvalidState {
                upload_id: session.upload_id,
                state: "COMPLETED without a result".to_string(),
            });
        }

        let target = UploadTarget::from_session(&session)?;
        let bitmap = self
            .store
            .parts_bitmap(target.upload_id, target.total_parts)
            .await?;
        let missing = missing_parts(&bitmap);
        if !missing.is_empty() {
            return Err(UploadError::IncompleteUpload {
                upload_id: target.upload_id,
                reason: format!("missing parts {}", format_parts(&missing)),
            });
        }

        let size = self
            .strategy(session.strategy()?)
            .complete(&target)
            .await?;
        let result_object_id = format!("{}/{}", target.bucket, target.key);
        let completed = self
            .store
            .complete_session(target.upload_id, &result_object_id, size)
            .await?;

        tracing::info!(upload_id = %target.upload_id, size, "Upload completed");
        Ok(FinalObjectDescriptor {
            bucket: completed.bucket,
            key: completed.object_key,
            size,
        })
    }

    /// Discard an in-progress upload and everything it stored.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn abort(&self, upload_id: UploadId) -> UploadResult<()> {
        let session = self.load_uploading(upload_id).await?;
        self.abort_session(&session).await
    }

    async fn abort_session(&self, session: &UploadSessionRow) -> UploadResult<()> {
        let target = UploadTarget::from_session(session)?;
        self.strategy(session.strategy()?).abort(&target).await?;
        self.store.delete_session(target.upload_id).await?;
        tracing::info!(upload_id = %target.upload_id, "Upload aborted");
        Ok(())
    }

    pub async fn get_status(&self, upload_id: UploadId) -> UploadResult<UploadStatus> {
        let session = self.load(upload_id).await?;
        self.status_of(&session).await
    }

    /// Presigned PUT URLs for the given parts.
    #[instrument(skip(self, part_numbers), fields(upload_id = %upload_id, parts = part_numbers.len()))]
    pub async fn presign_part_uploads(
        &self,
        upload_id: UploadId,
        part_numbers: &[u32],
    ) -> UploadResult<Vec<PresignedPart>> {
        let session = self.load_uploading(upload_id).await?;
        let target = UploadTarget::from_session(&session)?;
        let strategy = self.strategy(session.strategy()?);
        let ttl = self.config.presigned_url_ttl();

        let mut urls = Vec::with_capacity(part_numbers.len());
        for &part_number in part_numbers {
            validate_part_number(part_number, target.total_parts)?;
            let key = strategy.part_key(&target, part_number);
            let url = self.objects.presign_put(&target.bucket, &key, ttl).await?;
            urls.push(PresignedPart { part_number, url });
        }
        Ok(urls)
    }

    /// Presigned GET URL for a completed upload.
    pub async fn presign_download(&self, upload_id: UploadId) -> UploadResult<String> {
        let session = self.load(upload_id).await?;
        let state = session.state()?;
        if state != UploadState::Completed {
            return Err(UploadError::InvalidState {
                upload_id: session.upload_id,
                state: state.to_string(),
            });
        }
        Ok(self
            .objects
            .presign_get(
                &session.bucket,
                &session.object_key,
                self.config.presigned_url_ttl(),
            )
            .await?)
    }

    /// Current ranges of a merge-tree upload, lowest first.
    pub async fn list_ranges(&self, upload_id: UploadId) -> UploadResult<Vec<PartRange>> {
        Ok(self.store.list_ranges(*upload_id.as_uuid()).await?)
    }

    /// Uploads left untouched past the configured staleness window.
    pub async fn list_stale(&self, limit: u32) -> UploadResult<Vec<UploadId>> {
        Ok(self
            .store
            .list_stale(self.config.stale_after_days, limit)
            .await?
            .into_iter()
            .map(UploadId::from_uuid)
            .collect())
    }
}

fn validate_part_number(part_number: u32, total_parts: u32) -> UploadResult<()> {
    if part_number < 1 || part_number > total_parts {
        return Err(splice_core::Error::InvalidPartNumber {
            part_number,
            total_parts,
        }
        .into());
    }
    Ok(())
}

fn missing_parts(bitmap: &str) -> Vec<u32> {
    bitmap
        .bytes()
        .zip(1u32..)
        .filter(|(bit, _)| *bit != b'1')
        .map(|(_, n)| n)
        .collect()
}

/// Render part numbers for messages, eliding long lists.
fn format_parts(parts: &[u32]) -> String {
    const SHOWN: usize = 10;
    let mut out = parts
        .iter()
        .take(SHOWN)
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if parts.len() > SHOWN {
        out.push_str(&format!(" and {} more", parts.len() - SHOWN));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parts() {
        assert_eq!(missing_parts("1101"), vec![3]);
        assert!(missing_parts("111").is_empty());
    }

    #[test]
    fn test_format_parts_elides() {
        let parts: Vec<u32> = (1..=12).collect();
        assert_eq!(format_parts(&parts[..2]), "1, 2");
        assert_eq!(format_parts(&parts), "1, 2, 3, 4, 5, 6, 7, 8, 9, 10 and 2 more");
    }

    #[test]
    fn test_validate_part_number() {
        assert!(validate_part_number(1, 3).is_ok());
        assert!(validate_part_number(0, 3).is_err());
        assert!(validate_part_number(4, 3).is_err());
    }
}

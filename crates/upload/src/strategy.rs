//! The composition strategy interface shared by every provider.

use crate::error::{UploadError, UploadResult};
use async_trait::async_trait;
use splice_core::StrategyKind;
use splice_core::keys::{part_key, parts_base};
use splice_metadata::models::UploadSessionRow;
use splice_storage::{ObjectStore, StorageError};
use uuid::Uuid;

/// The parts of a session a strategy needs to address its objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadTarget {
    pub upload_id: Uuid,
    pub bucket: String,
    /// Key of the finished object.
    pub key: String,
    /// Provider upload token; empty for strategies that do not need one.
    pub token: String,
    pub total_parts: u32,
}

impl UploadTarget {
    pub fn from_session(session: &UploadSessionRow) -> UploadResult<Self> {
        Ok(Self {
            upload_id: session.upload_id,
            bucket: session.bucket.clone(),
            key: session.object_key.clone(),
            token: session.upload_token.clone(),
            total_parts: session.total_parts()?,
        })
    }

    /// Base key under which part and range objects live.
    pub fn parts_base(&self) -> String {
        parts_base(&self.key)
    }
}

/// How parts uploaded for a session become one object.
///
/// Chosen once when the session is created and stored with it.
#[async_trait]
pub trait ComposeStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Prepare provider state for a new upload and return its token.
    async fn allocate(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> UploadResult<String>;

    /// Undo [`allocate`](Self::allocate) for an allocation no session kept.
    async fn discard_allocation(
        &self,
        _bucket: &str,
        _key: &str,
        _token: &str,
    ) -> UploadResult<()> {
        Ok(())
    }

    /// Key a client uploads part `part_number` to.
    fn part_key(&self, target: &UploadTarget, part_number: u32) -> String {
        part_key(&target.parts_base(), part_number)
    }

    /// Accept an uploaded part after checking it against `part_md5`.
    async fn add_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        part_md5: &str,
    ) -> UploadResult<()>;

    /// Assemble the final object and return its size in bytes.
    async fn complete(&self, target: &UploadTarget) -> UploadResult<u64>;

    /// Discard every object the upload produced.
    async fn abort(&self, target: &UploadTarget) -> UploadResult<()>;
}

/// Check that the part object exists and its MD5 matches what the client sent.
pub(crate) async fn verify_part(
    objects: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    part_md5: &str,
) -> UploadResult<()> {
    let meta = objects.exists(bucket, key).await?.ok_or_else(|| {
        UploadError::Validation(format!(
            "part object {key} was not found; upload the part before adding it"
        ))
    })?;
    match meta.md5_hex {
        Some(actual) if actual.eq_ignore_ascii_case(part_md5) => Ok(()),
        Some(_) => Err(UploadError::Validation(
            "the provided MD5 does not match the MD5 of the uploaded part; re-upload the part"
                .to_string(),
        )),
        None => Err(UploadError::Validation(format!(
            "no checksum is available for part object {key}"
        ))),
    }
}

/// Delete an object, logging instead of failing. Absent objects are fine.
pub(crate) async fn delete_best_effort(
    objects: &dyn ObjectStore,
    upload_id: Uuid,
    bucket: &str,
    key: &str,
) {
    match objects.delete(bucket, key).await {
        Ok(()) | Err(StorageError::NotFound(_)) => {}
        Err(e) => {
            tracing::warn!(
                upload_id = %upload_id,
                key = %key,
                error = %e,
                "Failed to delete superseded object; leaving it as garbage"
            );
        }
    }
}

/// Remove leftover part objects under the upload's prefix and any finished
/// object already at the destination.
pub(crate) async fn sweep_objects(objects: &dyn ObjectStore, target: &UploadTarget) {
    let prefix = splice_core::keys::parts_prefix(&target.parts_base());
    match objects.list(&target.bucket, &prefix).await {
        Ok(keys) => {
            for key in keys {
                delete_best_effort(objects, target.upload_id, &target.bucket, &key).await;
            }
        }
        Err(e) => {
            tracing::warn!(
                upload_id = %target.upload_id,
                prefix = %prefix,
                error = %e,
                "Failed to list stray part objects"
            );
        }
    }
    delete_best_effort(objects, target.upload_id, &target.bucket, &target.key).await;
}

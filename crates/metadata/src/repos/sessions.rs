//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::{NewUploadSession, PartErrorRow, PartRecordRow, UploadSessionRow};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for upload session operations.
///
/// Every mutation bumps the session's `etag` and `updated_on`.
#[async_trait]
pub trait UploadSessionStore: Send + Sync {
    /// Create a session, or return the one already uploading for the same
    /// owner and request hash.
    async fn create_session(&self, session: &NewUploadSession) -> MetadataResult<UploadSessionRow>;

    /// Get an upload session by ID.
    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Get the uploading session for an owner's request, if any.
    async fn get_session_by_owner_and_hash(
        &self,
        owner_id: &str,
        request_hash: &str,
    ) -> MetadataResult<Option<UploadSessionRow>>;

    /// Upsert a part record and clear any error recorded for that part.
    async fn record_part_success(
        &self,
        upload_id: Uuid,
        part_number: u32,
        part_md5: &str,
    ) -> MetadataResult<()>;

    /// Upsert the error recorded for a part.
    async fn record_part_failure(
        &self,
        upload_id: Uuid,
        part_number: u32,
        message: &str,
    ) -> MetadataResult<()>;

    /// One `'1'`/`'0'` per part number in `1..=total_parts`.
    async fn parts_bitmap(&self, upload_id: Uuid, total_parts: u32) -> MetadataResult<String>;

    /// Part records in ascending part order.
    async fn list_parts(&self, upload_id: Uuid) -> MetadataResult<Vec<PartRecordRow>>;

    async fn list_part_errors(&self, upload_id: Uuid) -> MetadataResult<Vec<PartErrorRow>>;

    /// Mark the session completed and drop its part bookkeeping atomically.
    async fn complete_session(
        &self,
        upload_id: Uuid,
        result_object_id: &str,
        result_size: u64,
    ) -> MetadataResult<UploadSessionRow>;

    /// Delete a session along with its parts, errors and ranges.
    /// Returns false when no session existed.
    async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<bool>;

    /// Uploading sessions untouched for more than `older_than_days`.
    async fn list_stale(&self, older_than_days: u32, limit: u32) -> MetadataResult<Vec<Uuid>>;
}

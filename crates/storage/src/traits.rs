//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Metadata about a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// MD5 of the content, lowercase hex, when the backend knows it.
    pub md5_hex: Option<String>,
}

/// A part handed to [`NativeMultipart::complete_multipart`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// Entity tag returned for the part; the part MD5 for single-copy parts.
    pub etag: String,
}

/// Bucket-aware object storage.
///
/// Keys are `/`-separated and relative to the bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata for `key`, or `None` when absent.
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Metadata for `key`; `NotFound` when absent.
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        self.exists(bucket, key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")))
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes>;

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()>;

    /// Concatenate `sources`, in order, into a new object at `dest_key`.
    async fn compose(
        &self,
        _bucket: &str,
        _dest_key: &str,
        _sources: &[String],
    ) -> StorageResult<ObjectMeta> {
        Err(StorageError::Unsupported {
            backend: self.backend_name(),
            operation: "compose",
        })
    }

    /// Delete an object; `NotFound` when absent.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Move an object to a new key in the same bucket.
    async fn rename(&self, bucket: &str, src_key: &str, dest_key: &str) -> StorageResult<()>;

    /// Keys starting with `prefix`, in no particular order.
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>>;

    /// URL a client can PUT the object to until `ttl` elapses.
    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String>;

    /// URL a client can GET the object from until `ttl` elapses.
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String>;

    /// Provider-native multipart support, if any.
    fn native_multipart(&self) -> Option<&dyn NativeMultipart> {
        None
    }

    /// Static backend identifier used in logs.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Provider-assembled multipart uploads.
#[async_trait]
pub trait NativeMultipart: Send + Sync {
    /// Start an upload and return its provider token.
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<String>;

    /// Copy an existing object in as part `part_number`; returns the part's entity tag.
    async fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        part_number: u32,
        source_key: &str,
    ) -> StorageResult<String>;

    /// Assemble the parts, in part-number order, and return the object size.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<u64>;

    async fn abort_multipart(&self, bucket: &str, key: &str, token: &str) -> StorageResult<()>;
}

/// Validate a bucket name shared by the local backends.
pub(crate) fn check_bucket(bucket: &str) -> StorageResult<()> {
    if bucket.is_empty()
        || bucket.starts_with('.')
        || bucket.contains(['/', '\\'])
    {
        return Err(StorageError::InvalidBucket(bucket.to_string()));
    }
    Ok(())
}

/// MD5 of `data` as lowercase hex.
pub(crate) fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

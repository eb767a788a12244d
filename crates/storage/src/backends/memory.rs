//! In-process storage backend.
//!
//! Objects live in a map keyed by `(bucket, key)` and vanish with the
//! backend. Supports compose and native multipart so either upload strategy
//! can run against it.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    CompletedPart, NativeMultipart, ObjectMeta, ObjectStore, check_bucket, md5_hex,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    md5_hex: String,
}

impl StoredObject {
    fn new(data: Bytes) -> Self {
        let md5_hex = md5_hex(&data);
        Self { data, md5_hex }
    }

    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            size: self.data.len() as u64,
            md5_hex: Some(self.md5_hex.clone()),
        }
    }
}

/// Upload staged for native completion.
#[derive(Debug, Default)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, StoredObject>,
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
    uploads: RwLock<HashMap<String, PendingUpload>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all buckets.
    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of native multipart uploads still open.
    pub fn pending_uploads(&self) -> usize {
        self.uploads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lookup(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    fn store(&self, bucket: &str, key: &str, object: StoredObject) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bucket.to_string(), key.to_string()), object);
    }
}

fn check_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    #[instrument(skip(self), fields(backend = "memory"))]
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>> {
        Ok(self.lookup(bucket, key).map(|o| o.meta()))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        self.lookup(bucket, key)
            .map(|o| o.data)
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")))
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        check_bucket(bucket)?;
        check_key(key)?;
        self.store(bucket, key, StoredObject::new(data));
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory", sources = sources.len()))]
    async fn compose(
        &self,
        bucket: &str,
        dest_key: &str,
        sources: &[String],
    ) -> StorageResult<ObjectMeta> {
        check_key(dest_key)?;
        let mut buf = BytesMut::new();
        for source in sources {
            let object = self
                .lookup(bucket, source)
                .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{source}")))?;
            buf.extend_from_slice(&object.data);
        }
        let composed = StoredObject::new(buf.freeze());
        let meta = composed.meta();
        self.store(bucket, dest_key, composed);
        Ok(meta)
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn rename(&self, bucket: &str, src_key: &str, dest_key: &str) -> StorageResult<()> {
        check_key(dest_key)?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let object = objects
            .remove(&(bucket.to_string(), src_key.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{src_key}")))?;
        objects.insert((bucket.to_string(), dest_key.to_string()), object);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        Ok(format!(
            "memory://{bucket}/{key}?method=PUT&ttl={}",
            ttl.as_secs()
        ))
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        Ok(format!(
            "memory://{bucket}/{key}?method=GET&ttl={}",
            ttl.as_secs()
        ))
    }

    fn native_multipart(&self) -> Option<&dyn NativeMultipart> {
        Some(self)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl NativeMultipart for MemoryBackend {
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        _content_type: Option<&str>,
    ) -> StorageResult<String> {
        check_bucket(bucket)?;
        check_key(key)?;
        let token = Uuid::new_v4().to_string();
        self.uploads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token.clone(),
                PendingUpload {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
        Ok(token)
    }

    async fn upload_part_copy(
        &self,
        bucket: &str,
        _key: &str,
        token: &str,
        part_number: u32,
        source_key: &str,
    ) -> StorageResult<String> {
        let source = self
            .lookup(bucket, source_key)
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{source_key}")))?;
        let etag = source.md5_hex.clone();
        let mut uploads = self.uploads.write().unwrap_or_else(PoisonError::into_inner);
        let upload = uploads
            .get_mut(token)
            .ok_or_else(|| StorageError::UploadNotFound(token.to_string()))?;
        upload.parts.insert(part_number, source);
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        token: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<u64> {
        let upload = self
            .uploads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .ok_or_else(|| StorageError::UploadNotFound(token.to_string()))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(StorageError::UploadNotFound(token.to_string()));
        }

        let mut ordered = parts.to_vec();
        ordered.sort_by_key(|p| p.part_number);
        let mut buf = BytesMut::new();
        for part in &ordered {
            let staged = upload
                .parts
                .get(&part.part_number)
                .filter(|s| s.md5_hex == part.etag.trim_matches('"'))
                .ok_or(StorageError::PartMismatch {
                    part_number: part.part_number,
                })?;
            buf.extend_from_slice(&staged.data);
        }
        let size = buf.len() as u64;
        self.store(bucket, key, StoredObject::new(buf.freeze()));
        Ok(size)
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, token: &str) -> StorageResult<()> {
        self.uploads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| StorageError::UploadNotFound(token.to_string()))
    }
}

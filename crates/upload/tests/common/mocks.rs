//! Mock implementations for testing.

use async_trait::async_trait;
use bytes::Bytes;
use splice_storage::{
    MemoryBackend, NativeMultipart, ObjectMeta, ObjectStore, StorageError, StorageResult,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Wraps [`MemoryBackend`], counting calls and injecting failures on demand.
#[allow(dead_code)]
#[derive(Default)]
pub struct InstrumentedStore {
    pub inner: MemoryBackend,
    pub compose_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub fail_compose: AtomicBool,
    pub fail_delete: AtomicBool,
    /// Park compose calls until [`release_compose`](Self::release_compose).
    pub hold_compose: AtomicBool,
    compose_parked: Notify,
    compose_released: Notify,
    /// Hide native multipart support.
    pub compose_only: bool,
}

#[allow(dead_code)]
impl InstrumentedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn compose_only() -> Arc<Self> {
        Arc::new(Self {
            compose_only: true,
            ..Self::default()
        })
    }

    pub fn set_fail_compose(&self, fail: bool) {
        self.fail_compose.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_hold_compose(&self, hold: bool) {
        self.hold_compose.store(hold, Ordering::SeqCst);
    }

    /// Wait until a compose call is parked.
    pub async fn compose_parked(&self) {
        self.compose_parked.notified().await;
    }

    pub fn release_compose(&self) {
        self.compose_released.notify_one();
    }

    pub fn compose_count(&self) -> usize {
        self.compose_calls.load(Ordering::SeqCst)
    }

    fn injected(operation: &str) -> StorageError {
        StorageError::Io(std::io::Error::other(format!("injected {operation} failure")))
    }
}

#[async_trait]
impl ObjectStore for InstrumentedStore {
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>> {
        self.inner.exists(bucket, key).await
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        self.inner.get(bucket, key).await
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(bucket, key, data).await
    }

    async fn compose(
        &self,
        bucket: &str,
        dest_key: &str,
        sources: &[String],
    ) -> StorageResult<ObjectMeta> {
        self.compose_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_compose.load(Ordering::SeqCst) {
            self.compose_parked.notify_one();
            self.compose_released.notified().await;
        }
        if self.fail_compose.load(Ordering::SeqCst) {
            return Err(Self::injected("compose"));
        }
        self.inner.compose(bucket, dest_key, sources).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(bucket, key).await
    }

    async fn rename(&self, bucket: &str, src_key: &str, dest_key: &str) -> StorageResult<()> {
        self.inner.rename(bucket, src_key, dest_key).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(bucket, prefix).await
    }

    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        self.inner.presign_put(bucket, key, ttl).await
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> StorageResult<String> {
        self.inner.presign_get(bucket, key, ttl).await
    }

    fn native_multipart(&self) -> Option<&dyn NativeMultipart> {
        if self.compose_only {
            None
        } else {
            self.inner.native_multipart()
        }
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}

//! Orchestrator wired to a temp SQLite store and an instrumented memory store.

use super::mocks::InstrumentedStore;
use bytes::Bytes;
use splice_core::config::UploadConfig;
use splice_core::keys::{part_key, parts_base};
use splice_core::{ManualClock, StrategyKind, UploadId, UploadRequest, UploadStatus};
use splice_metadata::{MetadataStore, SqliteStore};
use splice_storage::ObjectStore;
use splice_upload::UploadOrchestrator;
use std::sync::Arc;
use tempfile::TempDir;
use time::macros::datetime;

pub const OWNER: &str = "owner-42";

#[allow(dead_code)]
pub struct TestHarness {
    pub orchestrator: Arc<UploadOrchestrator>,
    pub store: Arc<dyn MetadataStore>,
    pub objects: Arc<InstrumentedStore>,
    pub clock: Arc<ManualClock>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut UploadConfig)) -> Self {
        Self::build(InstrumentedStore::new(), configure).await
    }

    pub async fn build(
        objects: Arc<InstrumentedStore>,
        configure: impl FnOnce(&mut UploadConfig),
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 09:00 UTC)));
        let store: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp_dir.path().join("meta.db"), 5)
                .await
                .expect("Failed to open metadata store")
                .with_clock(clock.clone()),
        );

        let mut config = UploadConfig {
            min_part_size: 1,
            ..UploadConfig::default()
        };
        configure(&mut config);

        let orchestrator = UploadOrchestrator::new(store.clone(), objects.clone(), config);
        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            objects,
            clock,
            _temp_dir: temp_dir,
        }
    }

    pub async fn initiate(&self, request: &UploadRequest) -> UploadStatus {
        self.orchestrator
            .initiate(OWNER, request, false)
            .await
            .expect("initiate upload")
    }

    /// Store `data` where a client would upload part `part_number`; returns its MD5.
    pub async fn put_part(&self, status: &UploadStatus, part_number: u32, data: &[u8]) -> String {
        let key = part_key(&parts_base(&status.key), part_number);
        self.objects
            .put(&status.bucket, &key, Bytes::copy_from_slice(data))
            .await
            .expect("put part");
        md5_hex(data)
    }

    /// Upload and add every part of `parts`, numbered from 1.
    pub async fn add_all(&self, status: &UploadStatus, parts: &[Vec<u8>]) {
        for (i, data) in parts.iter().enumerate() {
            let n = i as u32 + 1;
            let md5 = self.put_part(status, n, data).await;
            self.orchestrator
                .add_part(status.upload_id, n, &md5)
                .await
                .expect("add part");
        }
    }

    pub async fn object(&self, status: &UploadStatus) -> Option<Bytes> {
        self.objects.get(&status.bucket, &status.key).await.ok()
    }

    pub async fn leftover_part_objects(&self, status: &UploadStatus) -> Vec<String> {
        let prefix = format!("{}/", parts_base(&status.key));
        self.objects
            .list(&status.bucket, &prefix)
            .await
            .expect("list parts")
    }

    pub fn uuid(id: UploadId) -> uuid::Uuid {
        *id.as_uuid()
    }
}

#[allow(dead_code)]
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// `count` parts of `part_size` bytes, the last one `last_size` bytes.
#[allow(dead_code)]
pub fn make_parts(count: usize, part_size: usize, last_size: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let len = if i + 1 == count { last_size } else { part_size };
            vec![b'a' + (i % 26) as u8; len]
        })
        .collect()
}

/// A request matching `parts`, using `strategy`.
#[allow(dead_code)]
pub fn request_for(
    file_name: &str,
    parts: &[Vec<u8>],
    part_size: u64,
    strategy: StrategyKind,
) -> UploadRequest {
    let whole: Vec<u8> = parts.concat();
    UploadRequest {
        file_name: file_name.to_string(),
        content_type: Some("application/octet-stream".to_string()),
        file_size_bytes: whole.len() as u64,
        part_size_bytes: part_size,
        content_md5_hex: md5_hex(&whole),
        strategy: Some(strategy),
        source: None,
    }
}

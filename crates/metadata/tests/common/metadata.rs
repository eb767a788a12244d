//! Metadata store test utilities.

use splice_core::{ManualClock, SequentialIdGenerator};
use splice_metadata::{MetadataResult, MetadataStore, SqliteStore};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tempfile::TempDir;
use time::macros::datetime;

/// A test metadata store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    pub clock: Arc<ManualClock>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a store in a fresh temp directory with a manual clock and
    /// sequential ids.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 09:00 UTC)));
        let store = SqliteStore::new(&db_path, 5)
            .await?
            .with_clock(clock.clone())
            .with_id_generator(Arc::new(SequentialIdGenerator::new()));
        let arc_store = Arc::new(store);

        Ok(Self {
            store: arc_store.clone(),
            sqlite_store: arc_store,
            clock,
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

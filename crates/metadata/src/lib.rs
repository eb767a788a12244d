//! Metadata store abstraction and implementation for splice.
//!
//! This crate provides the control-plane data model:
//! - Upload sessions, part records and part errors
//! - Part ranges backing merge-tree uploads
//! - Advisory range locks

pub mod error;
pub mod lock;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use lock::{RangeLockGuard, RangeLockTable};
pub use repos::{PartRangeStore, RangeTransaction, UploadSessionStore};
pub use store::{MetadataStore, SqliteStore};

use splice_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *busy_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("metadata.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            busy_timeout_secs: 5,
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}

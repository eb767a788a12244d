//! Configuration types shared across crates.

use crate::upload::{PartLimits, StrategyKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage. Each bucket is a directory under `path`.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// In-process storage; contents vanish with the process.
    Memory,
    /// S3-compatible storage.
    S3 {
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a writer waits on a locked database before failing.
        #[serde(default = "default_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

/// Backoff applied when a range lock or completion attempt loses a race.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRetryConfig {
    /// Total attempts including the first (1 disables retrying).
    #[serde(default = "default_lock_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lock_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_lock_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_lock_max_attempts() -> u32 {
    1
}

fn default_lock_initial_backoff_ms() -> u64 {
    50
}

fn default_lock_max_backoff_ms() -> u64 {
    2000
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_lock_max_attempts(),
            initial_backoff_ms: default_lock_initial_backoff_ms(),
            max_backoff_ms: default_lock_max_backoff_ms(),
        }
    }
}

impl LockRetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Upload behavior configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Bucket new uploads are written to.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Strategy used when a request doesn't name one.
    #[serde(default = "default_strategy")]
    pub default_strategy: StrategyKind,
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    #[serde(default = "default_max_part_size")]
    pub max_part_size: u64,
    #[serde(default = "default_max_parts")]
    pub max_parts: u64,
    /// Contiguous pairs considered per added part.
    #[serde(default = "default_merge_attempts_per_part")]
    pub merge_attempts_per_part: u32,
    #[serde(default = "default_presigned_url_ttl_secs")]
    pub presigned_url_ttl_secs: u64,
    /// Sessions untouched this long are reported as stale.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u32,
    #[serde(default)]
    pub lock_retry: LockRetryConfig,
}

fn default_bucket() -> String {
    "uploads".to_string()
}

fn default_strategy() -> StrategyKind {
    StrategyKind::MergeTree
}

fn default_min_part_size() -> u64 {
    5 * 1024 * 1024
}

fn default_max_part_size() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_max_parts() -> u64 {
    10_000
}

fn default_merge_attempts_per_part() -> u32 {
    4
}

fn default_presigned_url_ttl_secs() -> u64 {
    900 // 15 minutes
}

fn default_stale_after_days() -> u32 {
    7
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            default_strategy: default_strategy(),
            min_part_size: default_min_part_size(),
            max_part_size: default_max_part_size(),
            max_parts: default_max_parts(),
            merge_attempts_per_part: default_merge_attempts_per_part(),
            presigned_url_ttl_secs: default_presigned_url_ttl_secs(),
            stale_after_days: default_stale_after_days(),
            lock_retry: LockRetryConfig::default(),
        }
    }
}

impl UploadConfig {
    pub fn part_limits(&self) -> PartLimits {
        PartLimits {
            min_part_size: self.min_part_size,
            max_part_size: self.max_part_size,
            max_parts: self.max_parts,
        }
    }

    pub fn presigned_url_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.presigned_url_ttl_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::days(i64::from(self.stale_after_days))
    }

    /// Validate upload configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.trim().is_empty() {
            return Err("upload.bucket must not be empty".to_string());
        }
        if self.min_part_size == 0 || self.min_part_size > self.max_part_size {
            return Err(format!(
                "upload.min_part_size {} must be non-zero and at most max_part_size {}",
                self.min_part_size, self.max_part_size
            ));
        }
        if self.max_parts == 0 || self.max_parts > u64::from(u32::MAX) {
            return Err(format!(
                "upload.max_parts {} must be between 1 and {}",
                self.max_parts,
                u32::MAX
            ));
        }
        if self.merge_attempts_per_part == 0 {
            return Err("upload.merge_attempts_per_part must be at least 1".to_string());
        }
        if self.lock_retry.max_attempts == 0 {
            return Err("upload.lock_retry.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Upload behavior.
    #[serde(default)]
    pub upload: UploadConfig,
}

impl AppConfig {
    /// Validate every section, reporting the first failure.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.upload.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_config_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.min_part_size, 5 * 1024 * 1024);
        assert_eq!(config.max_parts, 10_000);
        assert_eq!(config.merge_attempts_per_part, 4);
        assert_eq!(config.default_strategy, StrategyKind::MergeTree);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upload_config_deserialize_partial() {
        let json = r#"{"bucket": "scratch", "default_strategy": "native"}"#;
        let config: UploadConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bucket, "scratch");
        assert_eq!(config.default_strategy, StrategyKind::Native);
        assert_eq!(config.stale_after_days, 7);
        assert_eq!(config.lock_retry.max_attempts, 1);
    }

    #[test]
    fn test_upload_config_validate_rejects_inverted_part_sizes() {
        let config = UploadConfig {
            min_part_size: 10,
            max_part_size: 5,
            ..UploadConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_retry_backoff_doubles_and_caps() {
        let retry = LockRetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff(1).as_millis(), 100);
        assert_eq!(retry.backoff(2).as_millis(), 200);
        assert_eq!(retry.backoff(3).as_millis(), 350);
        assert_eq!(retry.backoff(40).as_millis(), 350);
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let config = StorageConfig::S3 {
            endpoint: None,
            region: None,
            access_key_id: Some("key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_tagged_variants() {
        let memory: StorageConfig = serde_json::from_str(r#"{"type": "memory"}"#).unwrap();
        assert!(matches!(memory, StorageConfig::Memory));

        let fs: StorageConfig =
            serde_json::from_str(r#"{"type": "filesystem", "path": "/tmp/x"}"#).unwrap();
        assert!(matches!(fs, StorageConfig::Filesystem { .. }));
    }

    #[test]
    fn test_metadata_config_busy_timeout_default() {
        let config: MetadataConfig =
            serde_json::from_str(r#"{"type": "sqlite", "path": "x.db"}"#).unwrap();
        match config {
            MetadataConfig::Sqlite {
                busy_timeout_secs, ..
            } => assert_eq!(busy_timeout_secs, 5),
        }
    }
}

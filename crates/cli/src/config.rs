//! Configuration loading for splicectl.

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use splice_core::config::AppConfig;
use std::path::Path;

/// Prefix for environment overrides, e.g. `SPLICE_UPLOAD__BUCKET=media`.
pub const ENV_PREFIX: &str = "SPLICE_";

/// Merge the optional TOML file at `path` with `SPLICE_` environment variables.
///
/// A missing file is not an error; defaults and the environment fill in.
pub fn load(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!(config_path = %path.display(), "No config file found");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["CONFIG"]))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_core::StrategyKind;
    use splice_core::config::{MetadataConfig, StorageConfig};

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("splice.toml");
        std::fs::write(
            &path,
            r#"
[storage]
type = "memory"

[metadata]
type = "sqlite"
path = "/var/lib/splice/meta.db"

[upload]
bucket = "media"
default_strategy = "native"
merge_attempts_per_part = 2

[upload.lock_retry]
max_attempts = 5
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert!(matches!(config.storage, StorageConfig::Memory));
        let MetadataConfig::Sqlite {
            busy_timeout_secs, ..
        } = config.metadata;
        assert_eq!(busy_timeout_secs, 5);
        assert_eq!(config.upload.bucket, "media");
        assert_eq!(config.upload.default_strategy, StrategyKind::Native);
        assert_eq!(config.upload.merge_attempts_per_part, 2);
        assert_eq!(config.upload.lock_retry.max_attempts, 5);
        assert_eq!(config.upload.lock_retry.initial_backoff_ms, 50);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.upload.bucket, "uploads");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("splice.toml");
        std::fs::write(&path, "[upload]\nmax_parts = 0\n").unwrap();
        assert!(load(&path).is_err());
    }
}

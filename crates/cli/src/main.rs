//! Operator CLI for splice multipart uploads.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use splice_core::UploadId;
use splice_core::config::AppConfig;
use splice_upload::{UploadOrchestrator, retry_on_contention};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "splicectl")]
#[command(about = "Inspect and manage splice multipart uploads")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "SPLICE_CONFIG", default_value = "splice.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show an upload's status
    Status {
        upload_id: String,
    },
    /// List the composed part ranges of a merge-tree upload
    Ranges {
        upload_id: String,
    },
    /// List uploads untouched past the staleness window
    Stale {
        /// Maximum number of uploads to list
        #[arg(long, default_value_t = 100)]
        limit: u32,
        /// Abort every listed upload
        #[arg(long, default_value_t = false)]
        abort: bool,
    },
    /// Assemble an upload whose parts have all been added
    Complete {
        upload_id: String,
    },
    /// Discard an upload and its stored parts
    Abort {
        upload_id: String,
    },
    /// Print a download URL for a completed upload
    Url {
        upload_id: String,
    },
}

fn parse_id(raw: &str) -> Result<UploadId> {
    UploadId::parse(raw).with_context(|| format!("invalid upload id {raw:?}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_orchestrator(config: &AppConfig) -> Result<UploadOrchestrator> {
    let objects = splice_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::debug!(backend = objects.backend_name(), "Storage backend initialized");

    let metadata = splice_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::debug!("Metadata store initialized");

    Ok(UploadOrchestrator::new(metadata, objects, config.upload.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config::load(&config)?;
    let orchestrator = Arc::new(build_orchestrator(&config).await?);
    let retry = &config.upload.lock_retry;

    match command {
        Commands::Status { upload_id } => {
            let status = orchestrator
                .get_status(parse_id(&upload_id)?)
                .await
                .context("failed to load upload")?;
            print_json(&status)
        }
        Commands::Ranges { upload_id } => {
            let ranges = orchestrator
                .list_ranges(parse_id(&upload_id)?)
                .await
                .context("failed to list ranges")?;
            for range in ranges {
                println!("{range}");
            }
            Ok(())
        }
        Commands::Stale { limit, abort } => {
            let stale = orchestrator
                .list_stale(limit)
                .await
                .context("failed to list stale uploads")?;
            for upload_id in stale {
                println!("{upload_id}");
                if abort {
                    let result = retry_on_contention(retry, || orchestrator.abort(upload_id)).await;
                    if let Err(e) = result {
                        tracing::warn!(
                            upload_id = %upload_id,
                            error = %e,
                            "Failed to abort stale upload"
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Complete { upload_id } => {
            let upload_id = parse_id(&upload_id)?;
            let result = retry_on_contention(retry, || orchestrator.complete(upload_id))
                .await
                .context("failed to complete upload")?;
            print_json(&result)
        }
        Commands::Abort { upload_id } => {
            let upload_id = parse_id(&upload_id)?;
            retry_on_contention(retry, || orchestrator.abort(upload_id))
                .await
                .context("failed to abort upload")?;
            tracing::info!(upload_id = %upload_id, "Upload aborted");
            Ok(())
        }
        Commands::Url { upload_id } => {
            let url = orchestrator
                .presign_download(parse_id(&upload_id)?)
                .await
                .context("failed to sign download URL")?;
            println!("{url}");
            Ok(())
        }
    }
}

//! Coordinator binary (spec §4.9). Loads configuration, wires the object
//! graph, and runs until signalled to stop. Grounded in
//! `riptide_workers::main` — CLI overrides for the handful of options an
//! operator tunes most often, JSON logs, then a `tokio::select!` against
//! `ctrl_c` around the long-running service.

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use matrix_browser::SessionLease;
use matrix_orchestrator::build_orchestrator;
use matrix_types::error::{ErrorClass, MatrixError};
use matrix_types::video::VideoSpec;
use matrix_worker::{ProgressReporter, UploadPerformer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "matrix-orchestrator")]
#[command(about = "Video upload matrix orchestrator")]
struct Args {
    #[arg(long)]
    redis_url: Option<String>,

    #[arg(long)]
    database_url: Option<String>,

    #[arg(long)]
    browser_api_url: Option<String>,

    #[arg(long)]
    max_concurrent_uploads: Option<usize>,
}

/// Stand-in for the platform-specific [`UploadPerformer`] this workspace
/// never implements (driving an actual site's upload UI is out of scope).
/// Fails every call with a classified, non-retryable error so a deployment
/// that forgets to supply a real performer degrades loudly instead of
/// silently marking accounts unhealthy.
struct UnimplementedPerformer;

#[async_trait]
impl UploadPerformer for UnimplementedPerformer {
    async fn perform_upload(
        &self,
        _session: &SessionLease,
        _video: &VideoSpec,
        _progress: &dyn ProgressReporter,
    ) -> Result<String, MatrixError> {
        Err(MatrixError::Classified {
            class: ErrorClass::Validation,
            message: "no UploadPerformer configured for this deployment".to_string(),
        })
    }

    async fn verify_logged_in(&self, _session: &SessionLease) -> Result<bool, MatrixError> {
        Ok(false)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).json().init();

    let args = Args::parse();

    let mut config = matrix_config::MatrixConfig::from_env()?;
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    if let Some(browser_api_url) = args.browser_api_url {
        config.browser.api_url = browser_api_url;
    }
    if let Some(max_concurrent_uploads) = args.max_concurrent_uploads {
        config.max_concurrent_uploads = max_concurrent_uploads;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_concurrent_uploads = config.max_concurrent_uploads,
        browser_api_url = %config.browser.api_url,
        "starting matrix orchestrator"
    );

    let running = build_orchestrator(config, Arc::new(UnimplementedPerformer)).await?;

    let shutdown_signal = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
        tracing::info!("shutdown signal received");
    };

    let supervisor = running.supervisor.clone();
    let poll_supervisor = async move {
        loop {
            if supervisor.shutdown_requested() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };

    tokio::select! {
        _ = shutdown_signal => {}
        _ = poll_supervisor => {
            tracing::warn!("supervisor requested shutdown due to a critical failure streak");
        }
    }

    running.orchestrator.shutdown().await;
    for handle in running.worker_handles {
        handle.abort();
    }
    running.supervisor_handle.abort();
    for handle in running.scheduler_handles {
        handle.abort();
    }

    tracing::info!("matrix orchestrator shutdown complete");
    Ok(())
}

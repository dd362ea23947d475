use std::{sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tracing::info;
use yt_downloader::{
    ApiError, AppConfig, AppState, build_router, fetcher::YtDlpFetcher,
    transfer::{cleanup_stale_download_jobs, spawn_stale_job_sweeper},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "yt_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create the transfer directory {:?}: {error}",
                config.transfer_dir
            ))
        })?;
    cleanup_stale_download_jobs(&config.transfer_dir, config.stale_job_seconds).await;
    spawn_stale_job_sweeper(
        config.transfer_dir.clone(),
        config.stale_job_seconds,
        Duration::from_secs(config.stale_sweep_interval_seconds),
    );

    if !config.repair_typo_prefix {
        info!("REPAIR_TYPO_PREFIX=false: URLs with a stray leading character will be rejected.");
    }

    let fetcher = Arc::new(YtDlpFetcher::from_config(&config));
    let addr = config.bind_addr.clone();
    let app = build_router(AppState::new(config, fetcher))?;

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!("YouTube downloader listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

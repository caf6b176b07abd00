// parkwatch - live parking space analysis server
// Streams analysis updates to WebSocket clients at /ws/scanner/analysis/

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parkwatch::config::{Args, ScannerConfig};
use parkwatch::server::{self, AppState, ANALYSIS_WS_PATH};
use parkwatch::{FfmpegOpener, OpenAiVisionAnalyzer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let config = ScannerConfig::try_from(Args::parse())
        .context("Invalid configuration")?;

    info!("🅿️  Starting parkwatch");
    info!("   Model: {} ({})", config.analyzer.model, config.analyzer.base_url);
    info!(
        "   Sampling every {} frames, pause {}ms, fault backoff {}s",
        config.session.sample_interval_frames,
        config.session.frame_pause.as_millis(),
        config.session.fault_backoff.as_secs()
    );

    if config.analyzer.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; analysis requests will be rejected upstream");
    }

    let analyzer = OpenAiVisionAnalyzer::new(config.analyzer.clone())
        .context("Failed to build inference client")?;

    let state = AppState::new(
        config.session.clone(),
        Arc::new(FfmpegOpener),
        Arc::new(analyzer),
    );

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    info!("   ✓ Listening on ws://{}{}", config.bind, ANALYSIS_WS_PATH);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    server::serve(listener, state, shutdown)
        .await
        .context("Server error")?;

    info!("parkwatch stopped");
    Ok(())
}

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use whisper_subtitle_service::config::Config;
use whisper_subtitle_service::server::{self, AppState, ServiceSettings};
use whisper_subtitle_service::transcription::{ModelLoader, WhisperModelFactory};
use whisper_subtitle_service::{telemetry, uploads};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    telemetry::init(&config.telemetry)?;

    tracing::info!(
        model = %config.model.name,
        device = config.model.device.as_str(),
        port = config.server.port,
        "whisper subtitle service starting"
    );

    let settings = ServiceSettings::from_config(&config)?;

    // Leftovers from a previous process that died mid-request
    let stale_after = Duration::from_secs(config.uploads.stale_after_secs);
    if let Err(e) = uploads::cleanup_stale_uploads(&settings.upload_dir, stale_after) {
        tracing::warn!("stale upload cleanup failed: {e:#}");
    }

    let factory = WhisperModelFactory::new(config.model.clone())?;
    let loader = ModelLoader::new(Arc::new(factory), config.transcription.load_timeout());

    // Load before accepting traffic; a failure here is fatal
    if config.model.preload {
        loader
            .preload()
            .await
            .context("failed to pre-load model")?;
    } else {
        tracing::info!("deferring model load until first request");
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{addr}");

    server::serve(listener, AppState::new(loader, settings)).await?;

    tracing::info!("whisper subtitle service stopped");
    Ok(())
}

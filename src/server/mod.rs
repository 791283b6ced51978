//! HTTP surface: `/health`, `/transcribe`, `/languages`.

/// Error taxonomy and its HTTP mapping
pub mod error;
/// Route handlers
pub mod handlers;
/// Static language catalog
pub mod languages;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::config::{Config, Device};
use crate::transcription::ModelLoader;

pub use error::ApiError;

/// Request-path settings fixed at startup
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Configured model size/variant, reported by `/health`
    pub model_name: String,
    /// Configured device, reported by `/health`
    pub device: Device,
    /// Language applied when a request carries none
    pub default_language: String,
    /// Where uploads are materialized
    pub upload_dir: PathBuf,
    /// Upper bound on one inference call
    pub transcribe_timeout: Duration,
    /// Largest accepted request body
    pub max_upload_bytes: usize,
}

impl ServiceSettings {
    /// Extract request-path settings from the process config
    ///
    /// # Errors
    /// Returns error if the upload directory cannot be expanded
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            model_name: config.model.name.clone(),
            device: config.model.device,
            default_language: config.transcription.default_language.clone(),
            upload_dir: Config::expand_path(&config.uploads.dir)?,
            transcribe_timeout: config.transcription.timeout(),
            max_upload_bytes: config.server.max_upload_bytes,
        })
    }
}

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    /// The process-wide model loader
    pub loader: ModelLoader,
    /// Startup settings
    pub settings: Arc<ServiceSettings>,
}

impl AppState {
    /// Bundle the loader with its settings
    #[must_use]
    pub fn new(loader: ModelLoader, settings: ServiceSettings) -> Self {
        Self {
            loader,
            settings: Arc::new(settings),
        }
    }
}

/// Build the service router
pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/transcribe", post(handlers::transcribe))
        .route("/languages", get(handlers::languages))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl+C
///
/// # Errors
/// Returns error if the server fails while accepting connections
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

//! HTTP surface of the service.
//!
//! - `POST /sfm` (configurable) runs one reconstruction per request
//! - `GET /healthz` liveness probe
//! - `GET /metrics` JSON metrics snapshot

mod handler;


pub use handler::{error_response, sfm_handler};

use crate::config::{Config, DefaultsConfig, ServerConfig};
use crate::ingest::ImageIngestor;
use crate::pipeline::{Metrics, MetricsReporter, MetricsSnapshot, PipelineOrchestrator};
use crate::registry::ConfigRegistry;
use crate::vision::{HlocBackend, VisionBackend};
use crate::workspace::WorkspaceManager;
use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared, read-only state handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConfigRegistry>,
    pub defaults: Arc<DefaultsConfig>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub workspaces: WorkspaceManager,
    pub ingestor: ImageIngestor,
    pub metrics: Arc<Metrics>,
    request_ids: Arc<AtomicU64>,
}

impl AppState {
    /// Wire the service from `config` around the given vision backend.
    pub fn new(config: &Config, backend: Arc<dyn VisionBackend>) -> Self {
        let metrics = Metrics::new();
        let orchestrator = PipelineOrchestrator::new(backend, config.pipeline.clone(), metrics.clone());
        Self {
            registry: Arc::new(config.build_registry()),
            defaults: Arc::new(config.defaults.clone()),
            orchestrator: Arc::new(orchestrator),
            workspaces: WorkspaceManager::from_config(&config.workspace),
            ingestor: ImageIngestor::new(config.pipeline.duplicate_filenames),
            metrics,
            request_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// State backed by hloc subprocesses.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(HlocBackend::from_config(&config.vision)))
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }
}

/// Build the application router.
pub fn router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route(&server.route, post(sfm_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(server.max_upload_bytes()))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Run the service until Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    config.validate()?;
    let bind_addr = config.bind_addr()?;

    let state = AppState::from_config(&config);
    tracing::info!(
        "Loaded {} extractor and {} matcher configurations",
        state.registry.len(crate::registry::ConfFamily::Extractors),
        state.registry.len(crate::registry::ConfFamily::Matchers),
    );
    tracing::info!("Workspaces under {}", state.workspaces.root().display());

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter = if config.metrics.enable {
        let reporter = MetricsReporter::new(state.metrics.clone(), config.metrics.interval_secs);
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        None
    };

    let app = router(state, &config.server);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;

    tracing::info!("Listening on http://{}{}", bind_addr, config.server.route);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    drop(shutdown_tx);
    if let Some(handle) = reporter {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}

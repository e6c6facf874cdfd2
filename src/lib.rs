//! SfM API
//!
//! HTTP service that turns a set of uploaded images into a sparse
//! structure-from-motion reconstruction, delivered as a zip archive.
//!
//! # Architecture
//!
//! A request moves through:
//!
//! - **Registry**: resolves the retrieval, feature and matcher conf keys
//! - **Workspace**: per-request scratch directory, removed on every exit path
//! - **Ingest**: writes the uploads under `images/`
//! - **Pipeline**: runs the five-stage plan against a [`vision::VisionBackend`]
//! - **Archive**: zips `sfm_colmap/` and hands it back as an in-memory payload
//! - **Server**: axum router tying the above together
//!
//! # Usage
//!
//! ```no_run
//! use sfm_api::{run_server, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_server(config).await
//! }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod vision;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, DuplicatePolicy};
pub use error::{ErrorKind, SfmError};
pub use pipeline::{Metrics, PipelineOrchestrator, PipelinePlan, StageId};
pub use registry::{ConfigRegistry, StageConf};
pub use server::AppState;
pub use workspace::{Workspace, WorkspaceManager};

use anyhow::Result;

/// Run the HTTP service until shutdown.
pub async fn run_server(config: Config) -> Result<()> {
    tracing::info!("Starting SfM API");
    server::serve(config).await
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

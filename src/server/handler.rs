//! The reconstruction endpoint.
//!
//! Request flow:
//! 1. Read the multipart body (image parts and optional conf key fields)
//! 2. Resolve all three conf keys, then require at least one image
//! 3. Create the workspace, ingest, run the stage plan, archive
//! 4. Load the archive into memory and remove the workspace
//! 5. Stream the archive, or answer with a JSON error
//!
//! Nothing touches the filesystem before step 3, and every path out of
//! step 3 or 4 removes the workspace before the response is produced.

use super::AppState;
use crate::archive::{build_archive_async, ArchivePayload, STREAM_CHUNK_SIZE};
use crate::error::{Result, SfmError};
use crate::ingest::UploadedImage;
use crate::pipeline::Phase;
use crate::registry::{ConfField, ConfKeys, PipelineConfig};
use crate::workspace::Workspace;
use axum::{
    body::Body,
    extract::{
        multipart::{Multipart, MultipartError, MultipartRejection},
        rejection::QueryRejection,
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::time::Instant;
use tracing::Instrument;

/// Multipart field carrying one image file.
pub const IMAGES_FIELD: &str = "images";

impl IntoResponse for SfmError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}

/// JSON error body `{"error": "..."}` with the status of the error kind.
pub fn error_response(err: &SfmError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": err.public_message() });
    (status, Json(body)).into_response()
}

/// `POST /sfm`: images in, zipped reconstruction out.
pub async fn sfm_handler(
    State(state): State<AppState>,
    query: std::result::Result<Query<ConfKeys>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let id = state.next_request_id();
    let span = tracing::info_span!("sfm_request", id);

    async move {
        let _active = state.metrics.start_request();
        let started = Instant::now();

        match handle(&state, query, multipart).await {
            Ok(payload) => {
                state.metrics.add_success(payload.len() as u64);
                tracing::info!(
                    "Request complete in {:.1}s, streaming {} bytes",
                    started.elapsed().as_secs_f64(),
                    payload.len()
                );
                archive_response(payload)
            }
            Err(err) => {
                if err.kind().is_client_error() {
                    state.metrics.add_rejection();
                    tracing::warn!("Rejected during {}: {}", err.phase(), err);
                } else {
                    state.metrics.add_failure();
                    tracing::error!("Failed during {}: {}", err.phase(), err);
                }
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn handle(
    state: &AppState,
    query: std::result::Result<Query<ConfKeys>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<ArchivePayload> {
    let Query(query_keys) = query.map_err(|e| SfmError::InvalidUpload(e.body_text()))?;
    let multipart = multipart.map_err(|e| SfmError::InvalidUpload(e.body_text()))?;
    let (form_keys, images) = read_upload(multipart).await?;

    let keys = form_keys.or(query_keys);
    let confs = state.registry.resolve_request(&keys, &state.defaults)?;
    if images.is_empty() {
        return Err(SfmError::NoImages);
    }
    tracing::info!(
        "Accepted {} images (retrieval={}, feature={}, matcher={})",
        images.len(),
        confs.retrieval.name,
        confs.feature.name,
        confs.matcher.name
    );

    let workspace = state.workspaces.create().map_err(SfmError::Workspace)?;
    let result = reconstruct(state, &workspace, &confs, &images).await;

    // The payload, if any, no longer borrows from the workspace
    if let Err(e) = workspace.close() {
        tracing::warn!("{} step failed: {}", Phase::Cleanup, e);
    }
    result
}

/// Everything that happens inside the workspace.
async fn reconstruct(
    state: &AppState,
    workspace: &Workspace,
    confs: &PipelineConfig,
    images: &[UploadedImage],
) -> Result<ArchivePayload> {
    let ingested = state.ingestor.ingest(workspace, images).await?;
    state
        .metrics
        .add_images(ingested.image_count() as u64, ingested.bytes_written);

    let report = state
        .orchestrator
        .run(workspace, confs, ingested.image_count())
        .await?;
    tracing::info!(
        "Pipeline finished in {:.1}s (num_matched={})",
        report.total_stage_time().as_secs_f64(),
        report.num_matched
    );

    let start = Instant::now();
    let summary = build_archive_async(report.reconstruction_dir, workspace.archive_path()).await?;
    state.metrics.add_archive_time(start.elapsed());
    tracing::info!(
        "Archived {} files ({} bytes) in {:.1}s",
        summary.entries.len(),
        summary.size,
        start.elapsed().as_secs_f64()
    );

    ArchivePayload::read(&summary.path).await
}

/// Split the multipart body into conf keys and image parts.
async fn read_upload(mut multipart: Multipart) -> Result<(ConfKeys, Vec<UploadedImage>)> {
    let mut keys = ConfKeys::default();
    let mut images = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(invalid_upload)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == IMAGES_FIELD {
            let filename = field.file_name().map(str::to_string);
            let data = field.bytes().await.map_err(invalid_upload)?;
            images.push(UploadedImage::new(filename, data));
        } else if let Some(conf_field) = ConfField::from_name(&name) {
            let value = field.text().await.map_err(invalid_upload)?;
            keys.set(conf_field, value.trim().to_string());
        } else {
            tracing::debug!("Ignoring multipart field '{}'", name);
        }
    }

    Ok((keys, images))
}

fn invalid_upload(e: MultipartError) -> SfmError {
    SfmError::InvalidUpload(e.body_text())
}

fn archive_response(payload: ArchivePayload) -> Response {
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (header::CONTENT_DISPOSITION, payload.content_disposition()),
        (header::CONTENT_LENGTH, payload.len().to_string()),
    ];
    let body = Body::from_stream(payload.into_stream(STREAM_CHUNK_SIZE));
    (StatusCode::OK, headers, body).into_response()
}

//! Persisting uploaded images into a workspace.

use crate::config::DuplicatePolicy;
use crate::error::{Result, SfmError};
use crate::workspace::Workspace;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One uploaded image as received from the caller.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: Option<String>,
    pub data: Bytes,
}

impl UploadedImage {
    pub fn new(filename: Option<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename,
            data: data.into(),
        }
    }
}

/// Images written to disk for one request.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Written files, in upload order
    pub paths: Vec<PathBuf>,
    pub bytes_written: u64,
}

impl IngestReport {
    pub fn image_count(&self) -> usize {
        self.paths.len()
    }
}

/// Writes uploads under `images/`, assigning each a unique file name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageIngestor {
    policy: DuplicatePolicy,
}

impl ImageIngestor {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    pub async fn ingest(&self, workspace: &Workspace, images: &[UploadedImage]) -> Result<IngestReport> {
        let images_dir = workspace.images_dir();
        let mut names = NameAssigner::new(self.policy, images.len());
        let mut report = IngestReport::default();

        for image in images {
            let name = names.assign(image.filename.as_deref(), synthesized_name)?;
            let path = images_dir.join(&name);
            tokio::fs::write(&path, &image.data)
                .await
                .map_err(|source| SfmError::Ingestion {
                    name: name.clone(),
                    source,
                })?;
            report.bytes_written += image.data.len() as u64;
            report.paths.push(path);
        }

        tracing::info!(
            "Ingested {} images ({} bytes) into {}",
            report.image_count(),
            report.bytes_written,
            images_dir.display()
        );
        Ok(report)
    }
}

/// Picks a unique file name per upload within one request.
#[derive(Debug)]
struct NameAssigner {
    policy: DuplicatePolicy,
    /// Every name handed out so far
    used: HashSet<String>,
    /// Names as the client supplied them (after sanitizing)
    supplied: HashSet<String>,
}

impl NameAssigner {
    fn new(policy: DuplicatePolicy, capacity: usize) -> Self {
        Self {
            policy,
            used: HashSet::with_capacity(capacity),
            supplied: HashSet::with_capacity(capacity),
        }
    }

    /// Only a repeat of a client-supplied name counts as a duplicate under
    /// `Reject`; clashes with synthesized or renamed names are renamed.
    fn assign(&mut self, supplied: Option<&str>, synthesize: impl FnOnce() -> String) -> Result<String> {
        let candidate = match supplied.and_then(sanitize_filename) {
            Some(name) => {
                if !self.supplied.insert(name.clone()) && self.policy == DuplicatePolicy::Reject {
                    return Err(SfmError::DuplicateFilename(name));
                }
                name
            }
            None => synthesize(),
        };

        if self.used.insert(candidate.clone()) {
            return Ok(candidate);
        }

        let (stem, ext) = split_extension(&candidate);
        let mut n = 1usize;
        loop {
            let renamed = format!("{}_{}{}", stem, n, ext);
            if self.used.insert(renamed.clone()) {
                tracing::debug!("Renamed duplicate upload '{}' to '{}'", candidate, renamed);
                return Ok(renamed);
            }
            n += 1;
        }
    }
}

/// Reduce a client-supplied name to a bare file name. Directory components
/// are dropped so a name can never escape `images/`.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last.chars().all(|c| c == '.') {
        return None;
    }
    Some(last.to_string())
}

fn synthesized_name() -> String {
    format!("image_{}.jpg", chrono::Utc::now().timestamp_millis())
}

fn split_extension(name: &str) -> (&str, &str) {
    let path = Path::new(name);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension()) {
        (Some(stem), Some(_)) if !stem.is_empty() => name.split_at(stem.len()),
        _ => (name, ""),
    }
}

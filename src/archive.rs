//! Packaging the reconstruction into a zip archive.
//!
//! Entries are named relative to the parent of the reconstruction
//! directory, so the archive unpacks to `sfm_colmap/...` rather than a flat
//! list of model files. Traversal is sorted by file name, which makes the
//! entry list a function of the tree alone.

use crate::error::{Result, SfmError};
use anyhow::Context;
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// Name the archive is delivered under.
pub const ARCHIVE_FILENAME: &str = "sfm_output.zip";

/// Size of the pieces the archive is streamed in.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// A finished archive on disk.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,

    /// Entry names in archive order
    pub entries: Vec<String>,

    /// Archive size in bytes
    pub size: u64,
}

/// Zip every file below `source_dir` into `dest`.
///
/// Fails if `source_dir` holds no files: an empty archive is never a valid
/// reconstruction result.
pub fn build_archive(source_dir: &Path, dest: &Path) -> anyhow::Result<ArchiveSummary> {
    let base = source_dir
        .parent()
        .with_context(|| format!("{} has no parent directory", source_dir.display()))?;
    if !source_dir.is_dir() {
        anyhow::bail!("reconstruction directory {} does not exist", source_dir.display());
    }

    let file = File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let mut entries = Vec::new();

    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", source_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry_name(base, entry.path())?;
        let size = entry.metadata()?.len();
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size >= u32::MAX as u64);

        let mut input = File::open(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        zip.start_file(name.as_str(), options)?;
        std::io::copy(&mut input, &mut zip)
            .with_context(|| format!("failed to compress {}", entry.path().display()))?;
        entries.push(name);
    }

    if entries.is_empty() {
        anyhow::bail!("reconstruction directory {} contains no files", source_dir.display());
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    drop(writer);

    let size = std::fs::metadata(dest)?.len();
    Ok(ArchiveSummary {
        path: dest.to_path_buf(),
        entries,
        size,
    })
}

/// Archive entry name: `path` relative to `base`, `/`-separated.
fn entry_name(base: &Path, path: &Path) -> anyhow::Result<String> {
    let relative = path
        .strip_prefix(base)
        .with_context(|| format!("{} is outside {}", path.display(), base.display()))?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Ok(parts.join("/"))
}

/// Build the archive on the blocking pool.
pub async fn build_archive_async(source_dir: PathBuf, dest: PathBuf) -> Result<ArchiveSummary> {
    tokio::task::spawn_blocking(move || build_archive(&source_dir, &dest))
        .await
        .map_err(|e| SfmError::archive(anyhow::anyhow!("archive task panicked: {}", e)))?
        .map_err(SfmError::archive)
}

/// A completed archive held in memory, detached from the workspace.
#[derive(Debug, Clone)]
pub struct ArchivePayload {
    pub filename: &'static str,
    pub bytes: Bytes,
}

impl ArchivePayload {
    /// Load the archive fully so the workspace can be removed before the
    /// first byte is sent.
    pub async fn read(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await.map_err(SfmError::Stream)?;
        Ok(Self {
            filename: ARCHIVE_FILENAME,
            bytes: Bytes::from(data),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn content_disposition(&self) -> String {
        format!("attachment; filename={}", self.filename)
    }

    /// The payload as a stream of `chunk_size` pieces (zero-copy slices).
    pub fn into_stream(self, chunk_size: usize) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        let chunk_size = chunk_size.max(1);
        let bytes = self.bytes;
        let chunks: Vec<Bytes> = (0..bytes.len())
            .step_by(chunk_size)
            .map(|start| bytes.slice(start..(start + chunk_size).min(bytes.len())))
            .collect();
        stream::iter(chunks.into_iter().map(Ok))
    }
}

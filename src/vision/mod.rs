//! Boundary to the computer-vision stages.
//!
//! The orchestrator only threads paths between stages; what happens inside
//! a stage is up to the [`VisionBackend`] implementation.

mod hloc;

pub use hloc::HlocBackend;

use crate::registry::StageConf;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};

/// Result of one stage: the path of the artifact it produced.
pub type StageFuture<'a> = BoxFuture<'a, anyhow::Result<PathBuf>>;

/// The four stage functions plus reconstruction.
///
/// Implementations must be cancel-safe: dropping a returned future abandons
/// the stage and must not leave work running in the background.
pub trait VisionBackend: Send + Sync {
    /// Extract local features or global descriptors for every image in
    /// `image_dir`, writing into `export_dir`.
    fn extract_features<'a>(
        &'a self,
        conf: &'a StageConf,
        image_dir: &'a Path,
        export_dir: &'a Path,
    ) -> StageFuture<'a>;

    /// Select up to `num_matched` retrieval neighbours per image and write
    /// the pair list to `output`.
    fn pairs_from_retrieval<'a>(
        &'a self,
        descriptors: &'a Path,
        output: &'a Path,
        num_matched: usize,
    ) -> StageFuture<'a>;

    /// Match local features between every listed pair.
    fn match_features<'a>(
        &'a self,
        conf: &'a StageConf,
        pairs: &'a Path,
        features: &'a Path,
        export_dir: &'a Path,
    ) -> StageFuture<'a>;

    /// Triangulate and bundle-adjust into `sfm_dir`.
    fn reconstruct<'a>(
        &'a self,
        sfm_dir: &'a Path,
        image_dir: &'a Path,
        pairs: &'a Path,
        features: &'a Path,
        matches: &'a Path,
    ) -> StageFuture<'a>;
}

/// Where an extractor configuration writes its artifact.
pub fn feature_path(export_dir: &Path, conf: &StageConf) -> PathBuf {
    export_dir.join(format!("{}.h5", conf.output))
}

/// Where a matcher writes its artifact for a given feature set and pair list.
pub fn match_path(export_dir: &Path, features: &Path, conf: &StageConf, pairs: &Path) -> PathBuf {
    let stem = |p: &Path| {
        p.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    export_dir.join(format!("{}_{}_{}.h5", stem(features), conf.output, stem(pairs)))
}

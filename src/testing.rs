//! In-process vision backend for tests.

use crate::pipeline::StageId;
use crate::registry::StageConf;
use crate::vision::{feature_path, match_path, StageFuture, VisionBackend};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub stage: StageId,
    pub inputs: Vec<PathBuf>,
    pub conf: Option<String>,
    pub num_matched: Option<usize>,
}

/// Backend writing small deterministic artifacts instead of running vision code.
#[derive(Debug, Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    fail_at: Option<StageId>,
    delay: Option<(StageId, Duration)>,
    empty_reconstruction: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(stage: StageId) -> Self {
        Self {
            fail_at: Some(stage),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, stage: StageId, delay: Duration) -> Self {
        self.delay = Some((stage, delay));
        self
    }

    pub fn with_empty_reconstruction(mut self) -> Self {
        self.empty_reconstruction = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stages_called(&self) -> Vec<StageId> {
        self.calls().into_iter().map(|c| c.stage).collect()
    }

    async fn enter(&self, call: Call) -> anyhow::Result<()> {
        let stage = call.stage;
        self.calls.lock().unwrap().push(call);
        if let Some((delayed, delay)) = self.delay {
            if delayed == stage {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail_at == Some(stage) {
            anyhow::bail!("injected failure in {}", stage);
        }
        Ok(())
    }
}

fn image_names(image_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(image_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

impl VisionBackend for FakeBackend {
    fn extract_features<'a>(
        &'a self,
        conf: &'a StageConf,
        image_dir: &'a Path,
        export_dir: &'a Path,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let stage = if conf.output.starts_with("global-") {
                StageId::RetrievalExtraction
            } else {
                StageId::FeatureExtraction
            };
            self.enter(Call {
                stage,
                inputs: vec![image_dir.to_path_buf()],
                conf: Some(conf.name.clone()),
                num_matched: None,
            })
            .await?;

            let path = feature_path(export_dir, conf);
            std::fs::write(&path, image_names(image_dir)?.join("\n"))?;
            Ok(path)
        })
    }

    fn pairs_from_retrieval<'a>(
        &'a self,
        descriptors: &'a Path,
        output: &'a Path,
        num_matched: usize,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            self.enter(Call {
                stage: StageId::PairGeneration,
                inputs: vec![descriptors.to_path_buf()],
                conf: None,
                num_matched: Some(num_matched),
            })
            .await?;

            let names = std::fs::read_to_string(descriptors)?;
            let names: Vec<&str> = names.lines().collect();
            let mut pairs = String::new();
            for (i, a) in names.iter().enumerate() {
                for b in names.iter().skip(i + 1).take(num_matched) {
                    pairs.push_str(&format!("{} {}\n", a, b));
                }
            }
            std::fs::write(output, pairs)?;
            Ok(output.to_path_buf())
        })
    }

    fn match_features<'a>(
        &'a self,
        conf: &'a StageConf,
        pairs: &'a Path,
        features: &'a Path,
        export_dir: &'a Path,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            self.enter(Call {
                stage: StageId::Matching,
                inputs: vec![pairs.to_path_buf(), features.to_path_buf()],
                conf: Some(conf.name.clone()),
                num_matched: None,
            })
            .await?;

            let path = match_path(export_dir, features, conf, pairs);
            std::fs::write(&path, b"matches")?;
            Ok(path)
        })
    }

    fn reconstruct<'a>(
        &'a self,
        sfm_dir: &'a Path,
        image_dir: &'a Path,
        pairs: &'a Path,
        features: &'a Path,
        matches: &'a Path,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            self.enter(Call {
                stage: StageId::Reconstruction,
                inputs: vec![
                    image_dir.to_path_buf(),
                    pairs.to_path_buf(),
                    features.to_path_buf(),
                    matches.to_path_buf(),
                ],
                conf: None,
                num_matched: None,
            })
            .await?;

            std::fs::create_dir_all(sfm_dir.join("models").join("0"))?;
            if !self.empty_reconstruction {
                for name in ["cameras.bin", "images.bin", "points3D.bin"] {
                    std::fs::write(sfm_dir.join(name), name.as_bytes())?;
                    std::fs::write(sfm_dir.join("models").join("0").join(name), name.as_bytes())?;
                }
                std::fs::write(sfm_dir.join("database.db"), b"db")?;
            }
            Ok(sfm_dir.to_path_buf())
        })
    }
}

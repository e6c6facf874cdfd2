//! Execution of the stage plan for one request.

use super::{Artifact, Metrics, PipelinePlan, StageDescriptor, StageId};
use crate::config::PipelineSettings;
use crate::error::{Result, SfmError};
use crate::registry::PipelineConfig;
use crate::vision::{StageFuture, VisionBackend};
use crate::workspace::Workspace;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long one stage took.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTiming {
    pub stage: StageId,
    pub elapsed: Duration,
}

/// Outcome of a complete pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Directory holding the final model
    pub reconstruction_dir: PathBuf,

    /// Retrieval candidates requested per image
    pub num_matched: usize,

    /// Completion order of stages with their durations
    pub timings: Vec<StageTiming>,
}

impl RunReport {
    pub fn total_stage_time(&self) -> Duration {
        self.timings.iter().map(|t| t.elapsed).sum()
    }
}

/// Fixed locations inside the workspace that stages write to.
struct StagePaths {
    outputs: PathBuf,
    pairs: PathBuf,
    sfm: PathBuf,
}

/// Everything one stage invocation needs.
struct RunContext<'a> {
    confs: &'a PipelineConfig,
    paths: StagePaths,
    num_matched: usize,
}

/// Runs the SfM stage plan against a vision backend.
pub struct PipelineOrchestrator {
    backend: Arc<dyn VisionBackend>,
    plan: PipelinePlan,
    settings: PipelineSettings,
    metrics: Arc<Metrics>,
}

impl PipelineOrchestrator {
    pub fn new(backend: Arc<dyn VisionBackend>, settings: PipelineSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            plan: PipelinePlan::sfm(),
            settings,
            metrics,
        }
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Retrieval candidates per image for a request with `image_count` images.
    pub fn num_matched(&self, image_count: usize) -> usize {
        image_count.min(self.settings.max_num_matched)
    }

    fn stage_timeout(&self) -> Option<Duration> {
        self.settings.stage_timeout_secs.map(Duration::from_secs)
    }

    /// Run every stage over the images already ingested into `workspace`.
    ///
    /// The first failing stage aborts the run; its error is returned as-is
    /// and no later stage starts.
    pub async fn run(
        &self,
        workspace: &Workspace,
        confs: &PipelineConfig,
        image_count: usize,
    ) -> Result<RunReport> {
        let ctx = RunContext {
            confs,
            paths: StagePaths {
                outputs: workspace.outputs_dir(),
                pairs: workspace.pairs_path(),
                sfm: workspace.sfm_dir(),
            },
            num_matched: self.num_matched(image_count),
        };

        let mut artifacts: HashMap<Artifact, PathBuf> = HashMap::new();
        artifacts.insert(Artifact::Images, workspace.images_dir());
        let mut timings = Vec::with_capacity(self.plan.len());

        if self.settings.parallel_feature_extraction {
            for wave in self.plan.waves() {
                let stages = wave.iter().filter_map(|id| self.plan.get(*id));
                let results = try_join_all(stages.map(|s| self.execute(s, &ctx, &artifacts))).await?;
                for (descriptor_output, path, timing) in results {
                    artifacts.insert(descriptor_output, path);
                    timings.push(timing);
                }
            }
        } else {
            for stage in self.plan.stages() {
                let (output, path, timing) = self.execute(stage, &ctx, &artifacts).await?;
                artifacts.insert(output, path);
                timings.push(timing);
            }
        }

        let terminal = self.plan.terminal();
        let reconstruction_dir = artifacts.remove(&terminal).ok_or_else(|| {
            SfmError::stage(
                StageId::Reconstruction,
                anyhow::anyhow!("pipeline finished without producing {}", terminal),
            )
        })?;

        Ok(RunReport {
            reconstruction_dir,
            num_matched: ctx.num_matched,
            timings,
        })
    }

    /// Run one stage with inputs looked up from `artifacts`.
    async fn execute(
        &self,
        stage: &StageDescriptor,
        ctx: &RunContext<'_>,
        artifacts: &HashMap<Artifact, PathBuf>,
    ) -> Result<(Artifact, PathBuf, StageTiming)> {
        let position = self.plan.position(stage.id).unwrap_or(0);
        tracing::info!("Stage {}/{}: {} started", position, self.plan.len(), stage.id);

        let start = Instant::now();
        let future = self.invoke(stage.id, ctx, artifacts)?;
        let result = match self.stage_timeout() {
            Some(limit) => match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_) => {
                    self.metrics.add_stage_timeout();
                    tracing::warn!("Stage {} timed out after {}s", stage.id, limit.as_secs());
                    return Err(SfmError::Timeout {
                        stage: stage.id,
                        secs: limit.as_secs(),
                    });
                }
            },
            None => future.await,
        };
        let elapsed = start.elapsed();
        self.metrics.add_stage_time(stage.id, elapsed);

        let path = result.map_err(|e| {
            tracing::warn!("Stage {} failed after {:.1}s: {:#}", stage.id, elapsed.as_secs_f64(), e);
            SfmError::stage(stage.id, e)
        })?;

        tracing::info!(
            "Stage {}/{}: {} finished in {:.1}s -> {}",
            position,
            self.plan.len(),
            stage.id,
            elapsed.as_secs_f64(),
            path.display()
        );

        Ok((
            stage.output,
            path,
            StageTiming {
                stage: stage.id,
                elapsed,
            },
        ))
    }

    /// Build the backend call for a stage. Only artifacts declared as inputs
    /// of the stage are read.
    fn invoke<'a>(
        &'a self,
        id: StageId,
        ctx: &'a RunContext<'a>,
        artifacts: &'a HashMap<Artifact, PathBuf>,
    ) -> Result<StageFuture<'a>> {
        let declared = self.plan.get(id).map(|s| s.inputs.as_slice()).unwrap_or(&[]);
        let input = |artifact: Artifact| -> Result<&'a Path> {
            if !declared.contains(&artifact) {
                return Err(SfmError::stage(
                    id,
                    anyhow::anyhow!("{} is not a declared input of {}", artifact, id),
                ));
            }
            artifacts.get(&artifact).map(PathBuf::as_path).ok_or_else(|| {
                SfmError::stage(id, anyhow::anyhow!("input {} has not been produced", artifact))
            })
        };

        let backend = self.backend.as_ref();
        let future = match id {
            StageId::RetrievalExtraction => backend.extract_features(
                &ctx.confs.retrieval,
                input(Artifact::Images)?,
                &ctx.paths.outputs,
            ),
            StageId::PairGeneration => backend.pairs_from_retrieval(
                input(Artifact::RetrievalDescriptors)?,
                &ctx.paths.pairs,
                ctx.num_matched,
            ),
            StageId::FeatureExtraction => backend.extract_features(
                &ctx.confs.feature,
                input(Artifact::Images)?,
                &ctx.paths.outputs,
            ),
            StageId::Matching => backend.match_features(
                &ctx.confs.matcher,
                input(Artifact::Pairs)?,
                input(Artifact::Features)?,
                &ctx.paths.outputs,
            ),
            StageId::Reconstruction => backend.reconstruct(
                &ctx.paths.sfm,
                input(Artifact::Images)?,
                input(Artifact::Pairs)?,
                input(Artifact::Features)?,
                input(Artifact::Matches)?,
            ),
        };
        Ok(future)
    }
}

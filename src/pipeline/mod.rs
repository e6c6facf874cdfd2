//! Stage plan, orchestration and metrics for SfM requests.

mod metrics;
mod orchestrator;
mod stages;

pub use metrics::{ActiveRequest, Metrics, MetricsReporter, MetricsSnapshot};
pub use orchestrator::{PipelineOrchestrator, RunReport, StageTiming};
pub use stages::{Artifact, PipelinePlan, PlanError, StageDescriptor, StageId};


/// Lifecycle phase of one request. Failures in any phase before
/// `Streaming` skip straight to cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validating,
    IngestingImages,
    Stage(StageId),
    Archiving,
    Streaming,
    Cleanup,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Validating => write!(f, "validating"),
            Phase::IngestingImages => write!(f, "ingesting images"),
            Phase::Stage(stage) => write!(f, "{}", stage),
            Phase::Archiving => write!(f, "archiving"),
            Phase::Streaming => write!(f, "streaming"),
            Phase::Cleanup => write!(f, "cleanup"),
        }
    }
}

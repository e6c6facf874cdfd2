//! Declarative description of the SfM stage graph.
//!
//! Stages name the artifacts they read and the one artifact they write. The
//! plan is validated once at construction, after which ordering and
//! dependency questions are answered from the descriptors alone:
//!
//! ```text
//!  images ─┬─▶ 1 retrieval ─▶ descriptors ─▶ 2 pairs ─▶ pairs ─┬──────────────┐
//!          │                                                  ▼              │
//!          ├─▶ 3 features ─▶ features ───────────────▶ 4 matching ─▶ matches │
//!          │                     │                                     │     ▼
//!          └─────────────────────┴─────────────────────────────────────┴─▶ 5 reconstruction
//! ```

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// One of the five vision stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    RetrievalExtraction,
    PairGeneration,
    FeatureExtraction,
    Matching,
    Reconstruction,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::RetrievalExtraction => "retrieval extraction",
            StageId::PairGeneration => "pair generation",
            StageId::FeatureExtraction => "feature extraction",
            StageId::Matching => "feature matching",
            StageId::Reconstruction => "reconstruction",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named data flowing between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Artifact {
    /// Ingested upload directory; exists before any stage runs
    Images,
    RetrievalDescriptors,
    Pairs,
    Features,
    Matches,
    Reconstruction,
}

impl Artifact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Artifact::Images => "images",
            Artifact::RetrievalDescriptors => "retrieval descriptors",
            Artifact::Pairs => "pairs",
            Artifact::Features => "features",
            Artifact::Matches => "matches",
            Artifact::Reconstruction => "reconstruction",
        }
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stage with its declared inputs and output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub id: StageId,
    pub inputs: Vec<Artifact>,
    pub output: Artifact,
}

impl StageDescriptor {
    pub fn new(id: StageId, inputs: &[Artifact], output: Artifact) -> Self {
        Self {
            id,
            inputs: inputs.to_vec(),
            output,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("pipeline plan has no stages")]
    Empty,

    #[error("{stage} reads {artifact} before any stage produces it")]
    UnavailableInput { stage: StageId, artifact: Artifact },

    #[error("{artifact} is produced by both {first} and {second}")]
    DuplicateProducer {
        artifact: Artifact,
        first: StageId,
        second: StageId,
    },

    #[error("{0} is listed twice")]
    DuplicateStage(StageId),
}

/// Ordered, validated list of stages.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    stages: Vec<StageDescriptor>,
    producers: HashMap<Artifact, StageId>,
}

impl PipelinePlan {
    /// Validate `stages` as an executable sequence: every input is either the
    /// image set or the output of an earlier stage, and each artifact has a
    /// single producer.
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, PlanError> {
        if stages.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut producers: HashMap<Artifact, StageId> = HashMap::new();
        let mut seen = BTreeSet::new();
        for stage in &stages {
            if !seen.insert(stage.id) {
                return Err(PlanError::DuplicateStage(stage.id));
            }
            for input in &stage.inputs {
                if *input != Artifact::Images && !producers.contains_key(input) {
                    return Err(PlanError::UnavailableInput {
                        stage: stage.id,
                        artifact: *input,
                    });
                }
            }
            if stage.output == Artifact::Images {
                return Err(PlanError::DuplicateProducer {
                    artifact: Artifact::Images,
                    first: stage.id,
                    second: stage.id,
                });
            }
            if let Some(first) = producers.insert(stage.output, stage.id) {
                return Err(PlanError::DuplicateProducer {
                    artifact: stage.output,
                    first,
                    second: stage.id,
                });
            }
        }

        Ok(Self { stages, producers })
    }

    /// The reference SfM pipeline, in reference execution order.
    pub fn sfm() -> Self {
        use Artifact::*;
        let stages = vec![
            StageDescriptor::new(StageId::RetrievalExtraction, &[Images], RetrievalDescriptors),
            StageDescriptor::new(StageId::PairGeneration, &[RetrievalDescriptors], Pairs),
            StageDescriptor::new(StageId::FeatureExtraction, &[Images], Features),
            StageDescriptor::new(StageId::Matching, &[Pairs, Features], Matches),
            StageDescriptor::new(
                StageId::Reconstruction,
                &[Images, Pairs, Features, Matches],
                Reconstruction,
            ),
        ];
        Self {
            producers: stages.iter().map(|s| (s.output, s.id)).collect(),
            stages,
        }
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// 1-based position of a stage in execution order.
    pub fn position(&self, id: StageId) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id).map(|i| i + 1)
    }

    pub fn producer(&self, artifact: Artifact) -> Option<StageId> {
        self.producers.get(&artifact).copied()
    }

    /// Output of the last stage.
    pub fn terminal(&self) -> Artifact {
        self.stages
            .last()
            .map(|s| s.output)
            .unwrap_or(Artifact::Images)
    }

    /// Stages whose outputs `id` reads directly.
    pub fn dependencies(&self, id: StageId) -> Vec<StageId> {
        let Some(stage) = self.get(id) else {
            return Vec::new();
        };
        let deps: BTreeSet<StageId> = stage
            .inputs
            .iter()
            .filter_map(|a| self.producer(*a))
            .collect();
        deps.into_iter().collect()
    }

    /// Whether `id` reads, directly or transitively, anything `other` writes.
    pub fn depends_on(&self, id: StageId, other: StageId) -> bool {
        let mut stack = self.dependencies(id);
        let mut visited = BTreeSet::new();
        while let Some(dep) = stack.pop() {
            if dep == other {
                return true;
            }
            if visited.insert(dep) {
                stack.extend(self.dependencies(dep));
            }
        }
        false
    }

    /// Group stages into waves that may run concurrently. Every stage in a
    /// wave depends only on stages from earlier waves; within a wave stages
    /// keep plan order.
    pub fn waves(&self) -> Vec<Vec<StageId>> {
        let mut level: HashMap<StageId, usize> = HashMap::new();
        for stage in &self.stages {
            let l = self
                .dependencies(stage.id)
                .iter()
                .filter_map(|d| level.get(d))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(stage.id, l);
        }

        let depth = level.values().copied().max().map_or(0, |m| m + 1);
        let mut waves = vec![Vec::new(); depth];
        for stage in &self.stages {
            waves[level[&stage.id]].push(stage.id);
        }
        waves
    }
}

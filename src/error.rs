//! Error taxonomy for a single SfM request.
//!
//! Every failure a request can hit is one `SfmError` variant. The variant
//! decides the HTTP status and whether the message is shown verbatim (client
//! errors) or behind the `Internal server error:` prefix.

use crate::pipeline::{Phase, StageId};
use crate::registry::{ConfFamily, ConfField};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SfmError>;

#[derive(Error, Debug)]
pub enum SfmError {
    #[error("{field} '{value}' not found in {family}")]
    UnknownConfig {
        field: ConfField,
        value: String,
        family: ConfFamily,
    },

    #[error("no images supplied: at least one image is required")]
    NoImages,

    #[error("duplicate image filename '{0}'")]
    DuplicateFilename(String),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("failed to write image '{name}': {source}")]
    Ingestion {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} failed: {source:#}")]
    Stage {
        stage: StageId,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: StageId, secs: u64 },

    #[error("failed to build archive: {0:#}")]
    Archive(anyhow::Error),

    #[error("failed to stream archive: {0}")]
    Stream(#[source] std::io::Error),

    #[error("workspace error: {0}")]
    Workspace(#[source] std::io::Error),
}

/// Coarse error category, one per row of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigValidation,
    InvalidRequest,
    Ingestion,
    Workspace,
    StageExecution,
    Timeout,
    Archive,
    Stream,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigValidation => "config_validation",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Ingestion => "ingestion",
            ErrorKind::Workspace => "workspace",
            ErrorKind::StageExecution => "stage_execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Archive => "archive",
            ErrorKind::Stream => "stream",
        }
    }

    /// Client errors are reported before the request touched the filesystem
    /// (or, for duplicates, after its workspace was removed).
    pub fn is_client_error(&self) -> bool {
        matches!(self, ErrorKind::ConfigValidation | ErrorKind::InvalidRequest)
    }

    pub fn status_code(&self) -> u16 {
        if self.is_client_error() {
            400
        } else {
            500
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SfmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SfmError::UnknownConfig { .. } => ErrorKind::ConfigValidation,
            SfmError::NoImages | SfmError::DuplicateFilename(_) | SfmError::InvalidUpload(_) => {
                ErrorKind::InvalidRequest
            }
            SfmError::Ingestion { .. } => ErrorKind::Ingestion,
            SfmError::Workspace(_) => ErrorKind::Workspace,
            SfmError::Stage { .. } => ErrorKind::StageExecution,
            SfmError::Timeout { .. } => ErrorKind::Timeout,
            SfmError::Archive(_) => ErrorKind::Archive,
            SfmError::Stream(_) => ErrorKind::Stream,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// Request phase the error was raised in.
    pub fn phase(&self) -> Phase {
        match self {
            SfmError::UnknownConfig { .. } | SfmError::NoImages | SfmError::InvalidUpload(_) => {
                Phase::Validating
            }
            SfmError::DuplicateFilename(_) | SfmError::Ingestion { .. } | SfmError::Workspace(_) => {
                Phase::IngestingImages
            }
            SfmError::Stage { stage, .. } | SfmError::Timeout { stage, .. } => Phase::Stage(*stage),
            SfmError::Archive(_) => Phase::Archiving,
            SfmError::Stream(_) => Phase::Streaming,
        }
    }

    /// Message as shown to the caller in the JSON `error` field.
    pub fn public_message(&self) -> String {
        if self.kind().is_client_error() {
            self.to_string()
        } else {
            format!("Internal server error: {}", self)
        }
    }

    pub fn stage<E: Into<anyhow::Error>>(stage: StageId, source: E) -> Self {
        Self::Stage {
            stage,
            source: source.into(),
        }
    }

    pub fn archive<E: Into<anyhow::Error>>(source: E) -> Self {
        Self::Archive(source.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_config_message() {
        let err = SfmError::UnknownConfig {
            field: ConfField::Feature,
            value: "bogus".to_string(),
            family: ConfFamily::Extractors,
        };
        assert_eq!(
            err.to_string(),
            "feature_conf_key 'bogus' not found in extract_features.confs"
        );
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.public_message(), err.to_string());
    }

    #[test]
    fn test_internal_errors_are_prefixed() {
        let err = SfmError::stage(StageId::Matching, anyhow::anyhow!("CUDA out of memory"));
        assert_eq!(err.kind(), ErrorKind::StageExecution);
        assert_eq!(err.status_code(), 500);
        assert_eq!(
            err.public_message(),
            "Internal server error: feature matching failed: CUDA out of memory"
        );
    }

    #[test]
    fn test_status_codes_per_kind() {
        assert_eq!(SfmError::NoImages.status_code(), 400);
        assert_eq!(SfmError::DuplicateFilename("a.jpg".into()).status_code(), 400);
        assert_eq!(
            SfmError::Timeout {
                stage: StageId::Reconstruction,
                secs: 10
            }
            .status_code(),
            500
        );
        assert_eq!(SfmError::archive(anyhow::anyhow!("unreadable")).status_code(), 500);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(SfmError::Stream(io).kind(), ErrorKind::Stream);
    }

    #[test]
    fn test_workspace_failure_has_own_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = SfmError::Workspace(io);
        assert_eq!(err.kind(), ErrorKind::Workspace);
        assert_eq!(err.kind().as_str(), "workspace");
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.public_message(), "Internal server error: workspace error: read-only");
    }

    #[test]
    fn test_phase_of_error() {
        assert_eq!(SfmError::NoImages.phase(), Phase::Validating);
        assert_eq!(
            SfmError::DuplicateFilename("a.jpg".into()).phase(),
            Phase::IngestingImages
        );
        assert_eq!(
            SfmError::stage(StageId::PairGeneration, anyhow::anyhow!("x")).phase(),
            Phase::Stage(StageId::PairGeneration)
        );
        assert_eq!(SfmError::archive(anyhow::anyhow!("x")).phase(), Phase::Archiving);
    }
}

//! Error taxonomy for the acquisition and inference pipeline

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::models::Progress;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Verify,
    Load,
    Preprocess,
    Infer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Verify => "verify",
            Stage::Load => "load",
            Stage::Preprocess => "preprocess",
            Stage::Infer => "infer",
        };
        f.write_str(name)
    }
}

/// How the presentation layer should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Pipeline is not initialized yet (show setup / progress)
    NotReady,
    /// A single request failed (offer retry)
    RequestFailed,
    /// The installed artifact is unusable and needs a full re-download
    Unusable,
}

/// Errors produced by the pipeline components
///
/// Messages are carried as strings so a single outcome can be cloned and
/// handed to every caller joined onto the same download or initialization.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Filesystem unreadable or unwritable
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport failure while fetching an artifact
    #[error("model download failed (progress {progress}): {message}")]
    ModelDownload { message: String, progress: Progress },

    /// Corrupt, incomplete or untrusted artifact
    #[error("model verification failed: {0}")]
    ModelVerification(String),

    /// Artifact present but unusable by the inference engine
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Input bytes are not a supported image encoding
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    /// Degenerate source image or target size
    #[error("image resize failed: {0}")]
    ImageResize(String),

    /// Call made before the session reached `Ready`
    #[error("inference session is not ready")]
    SessionNotReady,

    /// Engine failure during `run`
    #[error("inference failed: {0}")]
    InferenceExecution(String),

    /// Download cancelled by its last waiter or by an explicit cancel
    #[error("download cancelled")]
    Cancelled,
}

impl PipelineError {
    pub(crate) fn storage(context: &str, err: impl fmt::Display) -> Self {
        PipelineError::Storage(format!("{context}: {err}"))
    }

    pub(crate) fn download(message: impl Into<String>, progress: Progress) -> Self {
        PipelineError::ModelDownload {
            message: message.into(),
            progress,
        }
    }

    /// Stage this error naturally belongs to
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Storage(_)
            | PipelineError::ModelDownload { .. }
            | PipelineError::Cancelled => Stage::Download,
            PipelineError::ModelVerification(_) => Stage::Verify,
            PipelineError::ModelLoad(_) => Stage::Load,
            PipelineError::ImageDecode(_) | PipelineError::ImageResize(_) => Stage::Preprocess,
            PipelineError::SessionNotReady | PipelineError::InferenceExecution(_) => Stage::Infer,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::SessionNotReady => Disposition::NotReady,
            PipelineError::ModelVerification(_) | PipelineError::ModelLoad(_) => {
                Disposition::Unusable
            }
            _ => Disposition::RequestFailed,
        }
    }
}

/// Error returned by `process`, tagged with the stage that failed
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{stage} stage failed: {error}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl StageError {
    pub fn new(stage: Stage, error: PipelineError) -> Self {
        Self { stage, error }
    }

    pub fn disposition(&self) -> Disposition {
        self.error.disposition()
    }
}

impl From<PipelineError> for StageError {
    fn from(error: PipelineError) -> Self {
        Self {
            stage: error.stage(),
            error,
        }
    }
}

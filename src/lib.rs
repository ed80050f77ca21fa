//! SmolVLM Notes - photo to note extraction with an on-device vision-language model
//!
//! Downloads and verifies the model once, keeps it loaded in an ONNX Runtime
//! session and turns photos of notes into text.

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod storage;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

pub use config::PipelineConfig;
pub use error::{Disposition, PipelineError, Stage, StageError};
pub use pipeline::{NotesPipeline, PipelineStatus};
pub use vision::{InferenceResult, OrtEngine, SessionState, StructuredNote};

//! Vision Layer
//!
//! Turns photos into model input tensors, runs the vision-language model and
//! decodes its output into note text.

pub mod decode;
pub mod preprocess;
pub mod session;
pub mod structure;

use serde::Serialize;

pub use decode::{DecodedText, ModelOutput, TokenDecoder, Vocabulary};
pub use preprocess::{PreprocessedImage, TensorPreprocessor};
pub use session::{InferenceEngine, LoadedModel, OnnxSession, OrtEngine, SessionManager, SessionState};
pub use structure::{extract_structure, NoteSection, StructuredNote};

/// Result of processing one photo
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    /// Recognized note text
    pub text: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Title and sections, when the text has any
    pub structured: Option<StructuredNote>,
    /// Time spent in the model and decoder
    pub processing_time_ms: u64,
}

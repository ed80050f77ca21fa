//! Inference session lifecycle
//!
//! The [`SessionManager`] owns at most one loaded model and moves it through
//! `Unloaded -> Loading -> Ready -> Releasing -> Unloaded`. Runs are
//! serialized; a failed run leaves the session `Ready`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DecodeSettings;
use crate::error::PipelineError;

use super::decode::{ModelOutput, TokenDecoder, Vocabulary};
use super::preprocess::PreprocessedImage;
use super::structure::extract_structure;
use super::InferenceResult;

/// Loads model files into runnable sessions
pub trait InferenceEngine: Send + Sync {
    fn load(&self, model_path: &Path) -> Result<Box<dyn LoadedModel>, PipelineError>;
}

/// A model ready to run
pub trait LoadedModel: Send {
    /// Run one forward pass; the input is consumed
    fn run(&mut self, input: PreprocessedImage) -> Result<ModelOutput, PipelineError>;
}

/// ONNX Runtime backed engine
#[derive(Debug, Clone)]
pub struct OrtEngine {
    intra_threads: usize,
}

impl OrtEngine {
    pub fn new(intra_threads: usize) -> Self {
        Self {
            intra_threads: intra_threads.max(1),
        }
    }
}

impl Default for OrtEngine {
    fn default() -> Self {
        Self::new(4)
    }
}

impl InferenceEngine for OrtEngine {
    fn load(&self, model_path: &Path) -> Result<Box<dyn LoadedModel>, PipelineError> {
        let session = OnnxSession::new(model_path, self.intra_threads)?;
        Ok(Box::new(session))
    }
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file
    pub fn new(model_path: &Path, intra_threads: usize) -> Result<Self, PipelineError> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = build_session(model_path, intra_threads)
            .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();

        if input_names.is_empty() || output_names.is_empty() {
            return Err(PipelineError::ModelLoad(
                "model declares no inputs or no outputs".to_string(),
            ));
        }

        info!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            input_names, output_names
        );

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

fn build_session(model_path: &Path, intra_threads: usize) -> anyhow::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(ort::Error::<()>::from)?
        .with_intra_threads(intra_threads)
        .map_err(ort::Error::<()>::from)?
        .commit_from_file(model_path)?;
    Ok(session)
}

impl LoadedModel for OnnxSession {
    fn run(&mut self, input: PreprocessedImage) -> Result<ModelOutput, PipelineError> {
        let shape = input.shape();
        let tensor = Tensor::from_array((shape.clone(), input.data.into_boxed_slice()))
            .map_err(|e| {
                PipelineError::InferenceExecution(format!("failed to build input tensor {shape:?}: {e}"))
            })?;

        let input_name = self.input_names[0].as_str();
        let output_name = self.output_names[0].as_str();

        let outputs = self
            .session
            .run(ort::inputs![input_name => tensor])
            .map_err(|e| PipelineError::InferenceExecution(format!("forward pass failed: {e}")))?;

        let (out_shape, data) = outputs[output_name]
            .try_extract_tensor::<f32>()
            .map_err(|e| {
                PipelineError::InferenceExecution(format!(
                    "failed to extract output '{output_name}' as f32: {e}"
                ))
            })?;

        Ok(ModelOutput {
            shape: out_shape.iter().map(|dim| *dim as usize).collect(),
            data: data.to_vec(),
        })
    }
}

/// Lifecycle of the inference session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Releasing,
}

/// Loaded model plus the decoder for its outputs
struct InferenceSession {
    model: Box<dyn LoadedModel>,
    decoder: TokenDecoder,
    model_path: PathBuf,
}

/// Owns the single inference session
pub struct SessionManager {
    engine: Arc<dyn InferenceEngine>,
    decode: DecodeSettings,
    state: Mutex<SessionState>,
    // held for the whole of a load, run or release
    session: Mutex<Option<InferenceSession>>,
    loads: AtomicUsize,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn InferenceEngine>, decode: DecodeSettings) -> Self {
        Self {
            engine,
            decode,
            state: Mutex::new(SessionState::Unloaded),
            session: Mutex::new(None),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Number of times a model was actually loaded
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Load the model and its vocabulary; a no-op when already `Ready`
    ///
    /// Blocks; call from a blocking context.
    pub fn load(&self, model_path: &Path, vocab_path: &Path) -> Result<(), PipelineError> {
        let mut slot = self.session.lock();
        if slot.is_some() {
            debug!("Session already loaded");
            return Ok(());
        }

        self.set_state(SessionState::Loading);
        self.loads.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();

        let loaded = Vocabulary::from_file(vocab_path).and_then(|vocab| {
            let decoder = TokenDecoder::new(vocab, self.decode.clone());
            let model = self.engine.load(model_path)?;
            Ok(InferenceSession {
                model,
                decoder,
                model_path: model_path.to_path_buf(),
            })
        });

        match loaded {
            Ok(session) => {
                info!(
                    "Inference session ready ({:?}) in {}ms",
                    session.model_path,
                    start.elapsed().as_millis()
                );
                *slot = Some(session);
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Unloaded);
                warn!("Failed to load inference session: {}", e);
                Err(match e {
                    PipelineError::ModelLoad(_) => e,
                    other => PipelineError::ModelLoad(other.to_string()),
                })
            }
        }
    }

    /// Run one preprocessed photo through the model
    ///
    /// Blocks; concurrent runs are serialized.
    pub fn run(&self, input: PreprocessedImage) -> Result<InferenceResult, PipelineError> {
        let mut slot = self.session.lock();
        let session = match slot.as_mut() {
            Some(session) if self.is_ready() => session,
            _ => return Err(PipelineError::SessionNotReady),
        };

        let start = Instant::now();
        let output = session.model.run(input).map_err(|e| match e {
            PipelineError::InferenceExecution(_) => e,
            other => PipelineError::InferenceExecution(other.to_string()),
        })?;
        let decoded = session.decoder.decode(&output)?;
        let structured = extract_structure(&decoded.text);
        let processing_time_ms = start.elapsed().as_millis() as u64;

        debug!(
            "Inference finished in {}ms: {} steps, confidence {:.3}",
            processing_time_ms, decoded.steps, decoded.confidence
        );

        Ok(InferenceResult {
            text: decoded.text,
            confidence: decoded.confidence,
            structured,
            processing_time_ms,
        })
    }

    /// Drop the loaded model; safe to call in any state
    ///
    /// Waits for a run in progress to finish.
    pub fn release(&self) {
        let mut slot = self.session.lock();
        if slot.is_none() {
            self.set_state(SessionState::Unloaded);
            return;
        }

        self.set_state(SessionState::Releasing);
        if let Some(session) = slot.take() {
            info!("Releasing inference session ({:?})", session.model_path);
            drop(session);
        }
        self.set_state(SessionState::Unloaded);
    }
}

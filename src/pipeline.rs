//! Notes pipeline
//!
//! Ties the model acquirer, the preprocessor and the inference session
//! together: `initialize` makes sure the model is installed and loaded,
//! `process` turns one photo into note text.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::Engine as _;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ModelSettings, PipelineConfig};
use crate::error::{PipelineError, Stage, StageError};
use crate::models::{
    DownloadRequest, DownloadTask, HttpSource, ModelAcquirer, ModelArtifact, Progress,
};
use crate::storage::{self, ArtifactStore};
use crate::vision::{
    InferenceEngine, InferenceResult, SessionManager, SessionState, TensorPreprocessor,
};

type InitFuture = Shared<BoxFuture<'static, Result<(), PipelineError>>>;

/// Snapshot of the pipeline for status displays
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub session: SessionState,
    pub model_installed: bool,
    pub vocab_installed: bool,
    pub downloads_in_flight: usize,
    pub progress: Progress,
    pub models_dir: PathBuf,
}

/// Photo to note pipeline
pub struct NotesPipeline {
    model: ModelSettings,
    store: Arc<ArtifactStore>,
    acquirer: Arc<ModelAcquirer>,
    preprocessor: Arc<TensorPreprocessor>,
    sessions: Arc<SessionManager>,
    init: Mutex<Option<InitFuture>>,
}

impl NotesPipeline {
    /// Assemble a pipeline from already constructed parts
    pub fn new(
        config: &PipelineConfig,
        store: Arc<ArtifactStore>,
        acquirer: Arc<ModelAcquirer>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Self {
        Self {
            model: config.model.clone(),
            store,
            acquirer,
            preprocessor: Arc::new(TensorPreprocessor::new(config.input.clone())),
            sessions: Arc::new(SessionManager::new(engine, config.decode.clone())),
            init: Mutex::new(None),
        }
    }

    /// Build a pipeline downloading over HTTP into the configured directories
    pub fn from_config(config: &PipelineConfig, engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let models_dir = match &config.storage.models_dir {
            Some(dir) => dir.clone(),
            None => storage::default_models_dir()?,
        };
        let cache_dir = match &config.storage.cache_dir {
            Some(dir) => dir.clone(),
            None => storage::default_cache_dir()?,
        };
        debug!("Models: {:?}, cache: {:?}", models_dir, cache_dir);

        let store = Arc::new(ArtifactStore::new(models_dir, cache_dir));
        let source = Arc::new(HttpSource::new(
            Duration::from_secs(config.download.connect_timeout_secs),
            Duration::from_secs(config.download.read_timeout_secs),
        )?);
        let acquirer = Arc::new(
            ModelAcquirer::new(store.clone(), source).with_offline(config.download.is_offline()),
        );

        Ok(Self::new(config, store, acquirer, engine))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn acquirer(&self) -> &ModelAcquirer {
        &self.acquirer
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn preprocessor(&self) -> &TensorPreprocessor {
        &self.preprocessor
    }

    /// Install the model if needed and load the inference session
    ///
    /// Concurrent callers share one attempt. A no-op once the session is
    /// `Ready`; after a failure the next call starts over.
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        let attempt = {
            let mut slot = self.init.lock();
            match slot.as_ref() {
                Some(running) if running.peek().is_none() => running.clone(),
                _ => {
                    if self.sessions.is_ready() {
                        return Ok(());
                    }
                    let attempt = self.start_initialize();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.await;

        let mut slot = self.init.lock();
        if slot.as_ref().is_some_and(|current| current.peek().is_some()) {
            *slot = None;
        }
        result
    }

    fn start_initialize(&self) -> InitFuture {
        let store = self.store.clone();
        let acquirer = self.acquirer.clone();
        let sessions = self.sessions.clone();
        let model = self.model.model_request();
        let vocab = self.model.vocab_request();

        async move {
            info!("Initializing pipeline for {}", model.id);
            store.ensure_directories()?;

            let (model, vocab) = tokio::try_join!(
                ensure_artifact(&store, &acquirer, model),
                ensure_artifact(&store, &acquirer, vocab),
            )?;

            tokio::task::spawn_blocking(move || sessions.load(&model.path, &vocab.path))
                .await
                .map_err(|e| PipelineError::ModelLoad(format!("load task failed: {e}")))?
        }
        .boxed()
        .shared()
    }

    /// Turn one encoded photo into note text
    ///
    /// Fails with `SessionNotReady` (and does nothing else) until
    /// `initialize` has succeeded.
    pub async fn process(&self, photo: Vec<u8>) -> Result<InferenceResult, StageError> {
        if !self.sessions.is_ready() {
            return Err(PipelineError::SessionNotReady.into());
        }

        let preprocessor = self.preprocessor.clone();
        let sessions = self.sessions.clone();
        let result = tokio::task::spawn_blocking(move || {
            let tensor = preprocessor
                .transform(&photo)
                .map_err(|e| StageError::new(Stage::Preprocess, e))?;
            drop(photo);
            sessions
                .run(tensor)
                .map_err(|e| StageError::new(Stage::Infer, e))
        })
        .await
        .map_err(|e| {
            StageError::new(
                Stage::Infer,
                PipelineError::InferenceExecution(format!("inference task failed: {e}")),
            )
        })?;

        match &result {
            Ok(output) => info!(
                "Processed photo in {}ms (confidence {:.2})",
                output.processing_time_ms, output.confidence
            ),
            Err(e) => warn!("Processing failed: {}", e),
        }
        result
    }

    /// `process` for a base64 string, optionally a `data:` URL
    pub async fn process_base64(&self, encoded: &str) -> Result<InferenceResult, StageError> {
        if !self.sessions.is_ready() {
            return Err(PipelineError::SessionNotReady.into());
        }
        let payload = match encoded.find("base64,") {
            Some(start) => &encoded[start + "base64,".len()..],
            None => encoded,
        };
        let photo = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| {
                StageError::new(
                    Stage::Preprocess,
                    PipelineError::ImageDecode(format!("invalid base64: {e}")),
                )
            })?;
        self.process(photo).await
    }

    /// Release the inference session; installed artifacts are kept
    ///
    /// Safe to call repeatedly and before `initialize`.
    pub async fn cleanup(&self) {
        let sessions = self.sessions.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || sessions.release()).await {
            warn!("Session release task failed: {}", e);
        }
    }

    /// Progress of the model download, while one is running
    pub fn download_progress(&self) -> Option<watch::Receiver<DownloadTask>> {
        self.acquirer.progress(&self.model.model_id())
    }

    /// Latest known model download progress
    ///
    /// `Fraction(1.0)` once the model is installed.
    pub fn last_progress(&self) -> Progress {
        if let Some(task) = self.download_progress() {
            return task.borrow().progress;
        }
        match self.store.exists(&self.model.model_id()) {
            Ok(true) => Progress::Fraction(1.0),
            _ => Progress::Unknown,
        }
    }

    pub fn status(&self) -> Result<PipelineStatus, PipelineError> {
        Ok(PipelineStatus {
            session: self.sessions.state(),
            model_installed: self.store.exists(&self.model.model_id())?,
            vocab_installed: self.store.exists(&self.model.vocab_id())?,
            downloads_in_flight: self.acquirer.in_flight_count(),
            progress: self.last_progress(),
            models_dir: self.store.models_dir().to_path_buf(),
        })
    }

    /// Delete leftover scratch files; refused while a download is running
    pub fn purge_cache(&self) -> Result<usize, PipelineError> {
        let running = self.acquirer.in_flight_count();
        if running > 0 {
            return Err(PipelineError::Storage(format!(
                "cannot purge cache while {running} download(s) are in flight"
            )));
        }
        let removed = self.store.purge_cache()?;
        info!("Purged {} cached file(s)", removed);
        Ok(removed)
    }

    /// Release the session, stop downloads and remove installed artifacts
    pub async fn delete_model(&self) -> Result<(), PipelineError> {
        self.cleanup().await;
        for id in [self.model.model_id(), self.model.vocab_id()] {
            self.acquirer.cancel(&id);
            self.store.delete(&id)?;
        }
        info!("Deleted model {}@{}", self.model.name, self.model.version);
        Ok(())
    }
}

/// Installed artifact, downloading it first when missing
async fn ensure_artifact(
    store: &ArtifactStore,
    acquirer: &ModelAcquirer,
    request: DownloadRequest,
) -> Result<ModelArtifact, PipelineError> {
    if let Some(artifact) = store.artifact(&request.id)? {
        debug!("{} already installed", request.id);
        return Ok(artifact);
    }
    acquirer.fetch(request).await
}

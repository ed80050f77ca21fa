//! Model acquisition
//!
//! Streams a remote artifact into a scratch file, verifies it and publishes
//! it through the [`ArtifactStore`]. Concurrent requests for the same artifact
//! are joined onto a single in-flight attempt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::storage::ArtifactStore;

use super::{ArtifactId, ArtifactSource, IntegrityPolicy, ModelArtifact, Progress, ProgressTracker};

/// What to fetch and how to check it
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: ArtifactId,
    pub url: String,
    pub integrity: IntegrityPolicy,
}

/// Lifecycle of one download attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// Snapshot of a single download attempt, published to observers
///
/// A task is created per attempt and never reused; its scratch file name is
/// unique to the attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadTask {
    pub id: ArtifactId,
    pub source_url: String,
    pub temp_path: PathBuf,
    pub bytes_written: u64,
    /// Advertised size, if the source reported one
    pub total_bytes: Option<u64>,
    pub status: DownloadStatus,
    pub progress: Progress,
    /// Failure message once `status` is `Failed`
    pub error: Option<String>,
}

impl DownloadTask {
    fn new(request: &DownloadRequest, temp_path: PathBuf) -> Self {
        Self {
            id: request.id.clone(),
            source_url: request.url.clone(),
            temp_path,
            bytes_written: 0,
            total_bytes: None,
            status: DownloadStatus::Pending,
            progress: Progress::Unknown,
            error: None,
        }
    }
}

type Outcome = Option<Result<ModelArtifact, PipelineError>>;

/// Registry entry shared by every waiter of one attempt
struct InFlight {
    id: ArtifactId,
    task: watch::Receiver<DownloadTask>,
    outcome: watch::Receiver<Outcome>,
    cancel: CancellationToken,
    waiters: AtomicUsize,
}

type Registry = Arc<Mutex<HashMap<ArtifactId, Arc<InFlight>>>>;

/// Downloads, verifies and publishes model artifacts
pub struct ModelAcquirer {
    store: Arc<ArtifactStore>,
    source: Arc<dyn ArtifactSource>,
    in_flight: Registry,
    attempts: Arc<AtomicUsize>,
    offline: bool,
}

impl ModelAcquirer {
    /// Create an acquirer publishing into `store` and fetching from `source`
    pub fn new(store: Arc<ArtifactStore>, source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            store,
            source,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
            offline: false,
        }
    }

    /// Refuse all network access
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Start (or join) the download of `request.id`
    ///
    /// Must be called from within a Tokio runtime. If an attempt for the same
    /// artifact is already running, the returned handle waits on that attempt
    /// instead of starting a new one.
    pub fn download(&self, request: DownloadRequest) -> DownloadHandle {
        let mut registry = self.in_flight.lock();
        if let Some(existing) = registry.get(&request.id) {
            existing.waiters.fetch_add(1, Ordering::SeqCst);
            debug!("Joining in-flight download of {}", request.id);
            return DownloadHandle::new(existing.clone());
        }

        let temp_path = self.store.temp_path(&request.id);
        let task = DownloadTask::new(&request, temp_path);
        let (task_tx, task_rx) = watch::channel(task.clone());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let in_flight = Arc::new(InFlight {
            id: request.id.clone(),
            task: task_rx,
            outcome: outcome_rx,
            cancel: CancellationToken::new(),
            waiters: AtomicUsize::new(1),
        });
        registry.insert(request.id.clone(), in_flight.clone());
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let worker = DownloadWorker {
            store: self.store.clone(),
            source: self.source.clone(),
            registry: self.in_flight.clone(),
            cancel: in_flight.cancel.clone(),
            offline: self.offline,
            request,
            task,
            task_tx,
        };
        tokio::spawn(worker.run(outcome_tx));

        DownloadHandle::new(in_flight)
    }

    /// Download and wait for the result
    pub async fn fetch(&self, request: DownloadRequest) -> Result<ModelArtifact, PipelineError> {
        self.download(request).wait().await
    }

    /// Subscribe to the progress of an in-flight download
    pub fn progress(&self, id: &ArtifactId) -> Option<watch::Receiver<DownloadTask>> {
        self.in_flight.lock().get(id).map(|entry| entry.task.clone())
    }

    /// Cancel an in-flight download for every waiter
    ///
    /// Returns `false` if nothing was in flight for `id`.
    pub fn cancel(&self, id: &ArtifactId) -> bool {
        match self.in_flight.lock().get(id) {
            Some(entry) => {
                info!("Cancelling download of {}", id);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of downloads currently running
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Number of download attempts started since creation
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// One caller's view of an in-flight download
///
/// Cancelling a handle only aborts the transfer once every other waiter has
/// cancelled or dropped its handle. Dropping a handle stops waiting without
/// cancelling.
pub struct DownloadHandle {
    in_flight: Arc<InFlight>,
    released: AtomicBool,
    cancelled: CancellationToken,
}

impl DownloadHandle {
    fn new(in_flight: Arc<InFlight>) -> Self {
        Self {
            in_flight,
            released: AtomicBool::new(false),
            cancelled: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ArtifactId {
        &self.in_flight.id
    }

    /// Latest snapshot of the attempt
    pub fn snapshot(&self) -> DownloadTask {
        self.in_flight.task.borrow().clone()
    }

    /// Stream of snapshots; the final one carries a terminal status
    pub fn progress(&self) -> watch::Receiver<DownloadTask> {
        self.in_flight.task.clone()
    }

    /// Wait for the attempt to settle
    pub async fn wait(&self) -> Result<ModelArtifact, PipelineError> {
        if self.cancelled.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut outcome = self.in_flight.outcome.clone();
        let settled = tokio::select! {
            _ = self.cancelled.cancelled() => return Err(PipelineError::Cancelled),
            settled = outcome.wait_for(Option::is_some) => settled.map(|value| (*value).clone()),
        };

        match settled {
            Ok(Some(result)) => result,
            _ => Err(PipelineError::download(
                "download task ended without a result",
                self.snapshot().progress,
            )),
        }
    }

    /// Withdraw this waiter; the last one to cancel aborts the transfer
    pub fn cancel(&self) {
        if self.release() {
            info!("Last waiter cancelled download of {}", self.in_flight.id);
            self.in_flight.cancel.cancel();
        }
        self.cancelled.cancel();
    }

    /// Drop this waiter's reference; returns true if it was the last one
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.in_flight.waiters.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

impl Drop for DownloadHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Background task driving one attempt
struct DownloadWorker {
    store: Arc<ArtifactStore>,
    source: Arc<dyn ArtifactSource>,
    registry: Registry,
    cancel: CancellationToken,
    offline: bool,
    request: DownloadRequest,
    task: DownloadTask,
    task_tx: watch::Sender<DownloadTask>,
}

impl DownloadWorker {
    async fn run(mut self, outcome_tx: watch::Sender<Outcome>) {
        info!(
            "Downloading {} from {}",
            self.request.id, self.request.url
        );
        let result = self.transfer().await;

        match &result {
            Ok(artifact) => {
                self.task.status = DownloadStatus::Completed;
                info!(
                    "Successfully downloaded {} ({} bytes)",
                    artifact.id, artifact.size_bytes
                );
            }
            Err(PipelineError::Cancelled) => {
                self.store.discard_temp(&self.task.temp_path);
                self.task.status = DownloadStatus::Cancelled;
                info!("Download of {} cancelled", self.request.id);
            }
            Err(e) => {
                self.store.discard_temp(&self.task.temp_path);
                self.task.status = DownloadStatus::Failed;
                self.task.error = Some(e.to_string());
                warn!("Download of {} failed: {}", self.request.id, e);
            }
        }

        // later callers start a fresh attempt
        self.registry.lock().remove(&self.request.id);
        self.task_tx.send_replace(self.task.clone());
        outcome_tx.send_replace(Some(result));
    }

    fn publish_progress(&mut self, progress: Progress) {
        self.task.progress = progress;
        self.task_tx.send_replace(self.task.clone());
    }

    async fn transfer(&mut self) -> Result<ModelArtifact, PipelineError> {
        if self.offline {
            return Err(PipelineError::download(
                format!(
                    "offline mode: cannot download {}; place the file at {:?}",
                    self.request.url,
                    self.store.artifact_path(&self.request.id)
                ),
                Progress::Unknown,
            ));
        }

        self.store.ensure_directories()?;

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            response = self.source.open(&self.request.url) => response?,
        };

        if response.status != 200 {
            return Err(PipelineError::download(
                format!(
                    "download failed with status {}: {}",
                    response.status, self.request.url
                ),
                Progress::Unknown,
            ));
        }

        let total = response.content_length.filter(|len| *len > 0);
        debug!("Download size: {:?} bytes", total);
        self.task.total_bytes = total;
        self.task.status = DownloadStatus::InProgress;
        self.publish_progress(Progress::from_bytes(0, total));

        let mut file = tokio::fs::File::create(&self.task.temp_path)
            .await
            .map_err(|e| PipelineError::storage("create temp file", e))?;

        let mut hasher = Sha256::new();
        let mut tracker = ProgressTracker::new();
        let mut body = response.body;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| with_progress(e, tracker.current()))?;

            file.write_all(&chunk).await.map_err(|e| {
                PipelineError::download(
                    format!("failed to write to temp file: {e}"),
                    tracker.current(),
                )
            })?;
            hasher.update(&chunk);

            self.task.bytes_written += chunk.len() as u64;
            let progress = tracker.update(self.task.bytes_written, total);
            self.publish_progress(progress);
        }

        file.flush().await.map_err(|e| {
            PipelineError::download(format!("failed to flush temp file: {e}"), tracker.current())
        })?;
        file.sync_all().await.map_err(|e| {
            PipelineError::download(format!("failed to sync temp file: {e}"), tracker.current())
        })?;
        drop(file);

        if let Some(total) = total {
            if self.task.bytes_written != total {
                return Err(PipelineError::ModelVerification(format!(
                    "incomplete download: {} of {} bytes",
                    self.task.bytes_written, total
                )));
            }
        }

        let digest = format!("{:x}", hasher.finalize());
        let policy = self.request.integrity.clone();
        let store = self.store.clone();
        let id = self.request.id.clone();
        let temp_path = self.task.temp_path.clone();

        tokio::task::spawn_blocking(move || {
            policy.verify(&temp_path, &digest)?;
            store.publish(&temp_path, &id, &digest)
        })
        .await
        .map_err(|e| PipelineError::Storage(format!("publish task failed: {e}")))?
    }
}

/// Replace the progress carried by a download error with the last known one
fn with_progress(error: PipelineError, progress: Progress) -> PipelineError {
    match error {
        PipelineError::ModelDownload { message, .. } => {
            PipelineError::ModelDownload { message, progress }
        }
        other => other,
    }
}

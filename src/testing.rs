//! In-memory doubles for the network and the model runtime

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;

use crate::error::PipelineError;
use crate::models::{ArtifactSource, Progress, SourceResponse};
use crate::vision::{InferenceEngine, LoadedModel, ModelOutput, PreprocessedImage};

enum AdvertisedLength {
    Actual,
    Fixed(u64),
    Absent,
}

/// Serves registered byte payloads by URL
pub(crate) struct FakeSource {
    files: HashMap<String, Vec<u8>>,
    status: u16,
    chunk_size: usize,
    length: AdvertisedLength,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
    opens: Mutex<HashMap<String, usize>>,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self {
            files: HashMap::new(),
            status: 200,
            chunk_size: 64,
            length: AdvertisedLength::Actual,
            fail_after: None,
            stall_after: None,
            opens: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_file(mut self, url: &str, data: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), data);
        self
    }

    pub(crate) fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Fail the body with a transport error after `chunks` chunks
    pub(crate) fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    pub(crate) fn with_content_length(mut self, length: u64) -> Self {
        self.length = AdvertisedLength::Fixed(length);
        self
    }

    pub(crate) fn without_content_length(mut self) -> Self {
        self.length = AdvertisedLength::Absent;
        self
    }

    /// Stop yielding (without ending) after `chunks` chunks
    pub(crate) fn stalling_after(mut self, chunks: usize) -> Self {
        self.stall_after = Some(chunks);
        self
    }

    /// How many times `url` was opened
    pub(crate) fn opens(&self, url: &str) -> usize {
        self.opens.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ArtifactSource for FakeSource {
    async fn open(&self, url: &str) -> Result<SourceResponse, PipelineError> {
        *self.opens.lock().entry(url.to_string()).or_default() += 1;

        let Some(data) = self.files.get(url) else {
            return Ok(SourceResponse {
                status: 404,
                content_length: None,
                body: stream::empty().boxed(),
            });
        };

        let mut chunks: Vec<Result<Vec<u8>, PipelineError>> = data
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        if let Some(n) = self.fail_after {
            chunks.truncate(n);
            chunks.push(Err(PipelineError::download(
                "connection reset by peer",
                Progress::Unknown,
            )));
        }

        let body = match self.stall_after {
            Some(n) => stream::iter(chunks)
                .take(n)
                .chain(stream::pending())
                .boxed(),
            None => stream::iter(chunks).boxed(),
        };

        let content_length = match self.length {
            AdvertisedLength::Actual => Some(data.len() as u64),
            AdvertisedLength::Fixed(length) => Some(length),
            AdvertisedLength::Absent => None,
        };

        Ok(SourceResponse {
            status: self.status,
            content_length,
            body,
        })
    }
}

/// Vocabulary of the scripted note, one token per line
pub(crate) fn note_vocabulary() -> String {
    [
        "<pad>",
        "<end_of_utterance>",
        "#",
        "\u{2581}Meeting",
        "\u{2581}notes",
        "<0x0A>",
        "##",
        "\u{2581}Agenda",
        "\u{2581}Budget",
        "\u{2581}review",
    ]
    .join("\n")
}

/// Token ids spelling "# Meeting notes\n## Agenda\nBudget review" then EOS
const NOTE_SCRIPT: [usize; 10] = [2, 3, 4, 5, 6, 7, 5, 8, 9, 1];
const NOTE_VOCAB_SIZE: usize = 10;

/// Probability the scripted model assigns to each chosen token
pub(crate) const STUB_PROBABILITY: f32 = 0.95;

/// Counts overlapping model runs and remembers the most seen at once
#[derive(Default)]
pub(crate) struct RunTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl RunTracker {
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine whose model always "reads" the same note
pub(crate) struct StubEngine {
    fail_load: bool,
    fail_runs: bool,
    load_gate: Option<Arc<Barrier>>,
    tracker: Option<Arc<RunTracker>>,
}

impl StubEngine {
    pub(crate) fn new() -> Self {
        Self {
            fail_load: false,
            fail_runs: false,
            load_gate: None,
            tracker: None,
        }
    }

    /// Meet `gate` on entering `load`, then again before returning
    pub(crate) fn pausing_load(mut self, gate: Arc<Barrier>) -> Self {
        self.load_gate = Some(gate);
        self
    }

    /// Record runs in `tracker`; each run takes a little while
    pub(crate) fn tracking_runs(mut self, tracker: Arc<RunTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub(crate) fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub(crate) fn failing_runs(mut self) -> Self {
        self.fail_runs = true;
        self
    }
}

impl InferenceEngine for StubEngine {
    fn load(&self, model_path: &Path) -> Result<Box<dyn LoadedModel>, PipelineError> {
        if let Some(gate) = &self.load_gate {
            gate.wait();
            gate.wait();
        }
        if self.fail_load {
            return Err(PipelineError::ModelLoad("stub refuses to load".to_string()));
        }
        if !model_path.is_file() {
            return Err(PipelineError::ModelLoad(format!(
                "{} does not exist",
                model_path.display()
            )));
        }
        Ok(Box::new(StubModel {
            fail_runs: self.fail_runs,
            tracker: self.tracker.clone(),
        }))
    }
}

struct StubModel {
    fail_runs: bool,
    tracker: Option<Arc<RunTracker>>,
}

impl LoadedModel for StubModel {
    fn run(&mut self, input: PreprocessedImage) -> Result<ModelOutput, PipelineError> {
        if let Some(tracker) = &self.tracker {
            tracker.enter();
            std::thread::sleep(Duration::from_millis(50));
            tracker.exit();
        }
        if self.fail_runs {
            return Err(PipelineError::InferenceExecution("stub run failed".to_string()));
        }
        let expected: usize = input.shape().iter().product();
        if input.is_empty() || input.len() != expected {
            return Err(PipelineError::InferenceExecution(format!(
                "bad input: {} values for shape {:?}",
                input.len(),
                input.shape()
            )));
        }

        let chosen = STUB_PROBABILITY.ln();
        let other = ((1.0 - STUB_PROBABILITY) / (NOTE_VOCAB_SIZE - 1) as f32).ln();
        let mut data = Vec::with_capacity(NOTE_SCRIPT.len() * NOTE_VOCAB_SIZE);
        for id in NOTE_SCRIPT {
            data.extend((0..NOTE_VOCAB_SIZE).map(|i| if i == id { chosen } else { other }));
        }

        Ok(ModelOutput {
            shape: vec![1, NOTE_SCRIPT.len(), NOTE_VOCAB_SIZE],
            data,
        })
    }
}

/// Encode a gradient photo of the given size as JPEG
pub(crate) fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .expect("encode jpeg fixture");
    bytes
}

//! Remote artifact sources
//!
//! The acquirer talks to a source through [`ArtifactSource`] so tests can
//! substitute an in-memory fake for the HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::debug;

use crate::error::PipelineError;
use crate::models::Progress;

/// Response head plus a body stream of chunks
pub struct SourceResponse {
    /// Transport status code (HTTP semantics, 200 = success)
    pub status: u16,
    /// Advertised body length, if any
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Vec<u8>, PipelineError>>,
}

impl std::fmt::Debug for SourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Something that can stream a remote artifact
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Start fetching `url`; transport errors map to `ModelDownload`
    async fn open(&self, url: &str) -> Result<SourceResponse, PipelineError>;
}

/// HTTP(S) source backed by reqwest
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    /// Create a source that gives up on slow connects or stalled reads
    ///
    /// There is no limit on the whole transfer, so large artifacts on slow
    /// links still finish as long as bytes keep arriving.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, PipelineError> {
        Self::from_builder(client_builder(connect_timeout, read_timeout))
    }

    fn from_builder(builder: reqwest::ClientBuilder) -> Result<Self, PipelineError> {
        let client = builder.build().map_err(|e| {
            PipelineError::download(format!("failed to create HTTP client: {e}"), Progress::Unknown)
        })?;
        Ok(Self { client })
    }
}

fn client_builder(connect_timeout: Duration, read_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn open(&self, url: &str) -> Result<SourceResponse, PipelineError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            PipelineError::download(format!("request to {url} failed: {e}"), Progress::Unknown)
        })?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        debug!("GET {} -> {} ({:?} bytes)", url, status, content_length);

        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map(|bytes| bytes.to_vec()).map_err(|e| {
                    PipelineError::download(format!("error reading download stream: {e}"), Progress::Unknown)
                })
            })
            .boxed();

        Ok(SourceResponse {
            status,
            content_length,
            body,
        })
    }
}

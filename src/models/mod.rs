//! Model artifact management
//!
//! Handles downloading, verifying and publishing the model artifacts that the
//! inference session is loaded from.

pub mod download;
pub mod progress;
pub mod source;
pub mod verify;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use download::{DownloadHandle, DownloadRequest, DownloadStatus, DownloadTask, ModelAcquirer};
pub use progress::{Progress, ProgressTracker};
pub use source::{ArtifactSource, HttpSource, SourceResponse};
pub use verify::{compute_sha256, IntegrityPolicy};

/// Identity of a single on-disk artifact: model name + version + file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId {
    /// Model name, e.g. `HuggingFaceTB/SmolVLM-Instruct`
    pub model: String,
    /// Model version or revision
    pub version: String,
    /// File name inside the model directory
    pub file_name: String,
}

impl ArtifactId {
    pub fn new(
        model: impl Into<String>,
        version: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            version: version.into(),
            file_name: file_name.into(),
        }
    }

    /// Directory (relative to the model root) holding this model's files
    ///
    /// `@` separates the parts; `sanitize` never produces it, so distinct ids
    /// never share a directory.
    pub fn directory(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}@{}",
            sanitize(&self.model),
            sanitize(&self.version)
        ))
    }

    /// Canonical path of the artifact below `root`
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(self.directory()).join(sanitize(&self.file_name))
    }

    /// Flat name usable for scratch files in the cache directory
    pub fn scratch_stem(&self) -> String {
        format!(
            "{}@{}@{}",
            sanitize(&self.model),
            sanitize(&self.version),
            sanitize(&self.file_name)
        )
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.model, self.version, self.file_name)
    }
}

/// Reduce one id part to a single safe path component
fn sanitize(part: &str) -> String {
    let clean: String = part
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        })
        .collect();
    // "", "." and ".." would not name a file of their own
    if clean.chars().all(|c| c == '.') {
        "_".repeat(clean.len().max(1))
    } else {
        clean
    }
}

/// Integrity state of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Unknown,
    Verifying,
    Valid,
    Invalid,
}

/// A model file on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub id: ArtifactId,
    /// On-disk location
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the file contents
    pub sha256: String,
    pub integrity: IntegrityStatus,
}

impl ModelArtifact {
    /// A path is only usable once integrity has been established
    pub fn is_ready(&self) -> bool {
        self.integrity == IntegrityStatus::Valid
    }
}

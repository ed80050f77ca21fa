//! Manifest of published artifacts
//!
//! An artifact only counts as installed when it has an entry here; the entry
//! is written after the file has been verified and moved into place.

use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;
use crate::models::ArtifactId;

/// Record of one published artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: ArtifactId,
    pub size_bytes: u64,
    pub sha256: String,
    /// Unix timestamp (seconds) of publication
    pub published_at: u64,
}

impl ManifestEntry {
    pub fn new(id: ArtifactId, size_bytes: u64, sha256: String) -> Self {
        Self {
            id,
            size_bytes,
            sha256,
            published_at: unix_now(),
        }
    }
}

/// Manifest tracking published artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub version: String,
    pub artifacts: Vec<ManifestEntry>,
}

impl Default for ArtifactManifest {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            artifacts: Vec::new(),
        }
    }
}

impl ArtifactManifest {
    /// Load the manifest; a missing file is an empty manifest
    ///
    /// A manifest that cannot be parsed is discarded with a warning, which
    /// makes every artifact look absent and forces re-download.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(PipelineError::storage("read artifact manifest", e)),
        };

        match serde_json::from_str(&content) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                warn!("Ignoring unreadable manifest {:?}: {}", path, e);
                Ok(Self::default())
            }
        }
    }

    /// Write the manifest via a sibling temp file and rename
    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::storage("serialize artifact manifest", e))?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, content)
            .map_err(|e| PipelineError::storage("write artifact manifest", e))?;
        std::fs::rename(&staging, path)
            .map_err(|e| PipelineError::storage("replace artifact manifest", e))?;
        Ok(())
    }

    pub fn get(&self, id: &ArtifactId) -> Option<&ManifestEntry> {
        self.artifacts.iter().find(|entry| &entry.id == id)
    }

    /// Insert or replace the entry for `entry.id`
    pub fn upsert(&mut self, entry: ManifestEntry) {
        if let Some(existing) = self.artifacts.iter_mut().find(|e| e.id == entry.id) {
            *existing = entry;
        } else {
            self.artifacts.push(entry);
        }
    }

    /// Remove the entry for `id`, returning whether one existed
    pub fn remove(&mut self, id: &ArtifactId) -> bool {
        let before = self.artifacts.len();
        self.artifacts.retain(|entry| &entry.id != id);
        before != self.artifacts.len()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

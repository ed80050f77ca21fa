//! Artifact integrity checks

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::PipelineError;

/// What a downloaded file must satisfy before it is published
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityPolicy {
    /// Known-good hex SHA-256 digest; when present it is mandatory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Plausible size bounds `(min, max)` in bytes, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_range: Option<(u64, u64)>,
}

impl IntegrityPolicy {
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    pub fn with_size_range(mut self, min: u64, max: u64) -> Self {
        self.size_range = Some((min, max));
        self
    }

    /// Check a fully written file
    ///
    /// `digest` is the SHA-256 computed while streaming the file. Size bounds
    /// are always enforced when configured; without a digest they are the
    /// only guarantee and the result is logged as degraded.
    pub fn verify(&self, path: &Path, digest: &str) -> Result<u64, PipelineError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            PipelineError::ModelVerification(format!("{} is missing: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(PipelineError::ModelVerification(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let size = metadata.len();
        if size == 0 {
            return Err(PipelineError::ModelVerification(format!(
                "{} is empty",
                path.display()
            )));
        }

        if let Some((min, max)) = self.size_range {
            if size < min || size > max {
                return Err(PipelineError::ModelVerification(format!(
                    "size {size} bytes outside plausible range {min}..={max}"
                )));
            }
        }

        match &self.sha256 {
            Some(expected) => {
                if !expected.eq_ignore_ascii_case(digest) {
                    return Err(PipelineError::ModelVerification(format!(
                        "checksum mismatch: expected {expected}, got {digest}"
                    )));
                }
                info!("Checksum verified for {}", path.display());
            }
            None if self.size_range.is_some() => {
                warn!(
                    "No digest configured for {}; accepted on size-range check only (degraded verification)",
                    path.display()
                );
            }
            None => {
                warn!(
                    "No digest or size bounds configured for {}; accepted as non-empty only (degraded verification)",
                    path.display()
                );
            }
        }

        Ok(size)
    }
}

/// Hex SHA-256 of a file on disk
pub fn compute_sha256(path: &Path) -> Result<String, PipelineError> {
    let file = File::open(path)
        .map_err(|e| PipelineError::storage(&format!("open {} for hashing", path.display()), e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| PipelineError::storage("hash read", e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

//! Artifact store
//!
//! Owns the model directory (canonical artifacts + manifest) and the cache
//! directory (in-progress downloads). Nothing outside these two directories
//! is ever touched.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{ArtifactId, IntegrityStatus, ModelArtifact};

use super::manifest::{ArtifactManifest, ManifestEntry};

const MANIFEST_FILE: &str = "manifest.json";
const PARTIAL_EXTENSION: &str = "part";

/// Filesystem-backed store for model artifacts
#[derive(Debug)]
pub struct ArtifactStore {
    models_dir: PathBuf,
    cache_dir: PathBuf,
    /// Serializes manifest read-modify-write cycles
    manifest_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Create a store rooted at the given directories (created on first use)
    pub fn new(models_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            cache_dir: cache_dir.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Create the model and cache directories if absent
    pub fn ensure_directories(&self) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.models_dir)
            .map_err(|e| PipelineError::storage("create model directory", e))?;
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| PipelineError::storage("create cache directory", e))?;
        Ok(())
    }

    /// Canonical location of an artifact
    pub fn artifact_path(&self, id: &ArtifactId) -> PathBuf {
        id.path(&self.models_dir)
    }

    /// Fresh scratch path for one download attempt
    ///
    /// Every attempt gets a unique name so a partial file from a failed
    /// attempt is never picked up again.
    pub fn temp_path(&self, id: &ArtifactId) -> PathBuf {
        self.cache_dir.join(format!(
            "{}.{}.{}",
            id.scratch_stem(),
            uuid::Uuid::new_v4().simple(),
            PARTIAL_EXTENSION
        ))
    }

    fn manifest_path(&self) -> PathBuf {
        self.models_dir.join(MANIFEST_FILE)
    }

    /// Whether a verified artifact is installed
    ///
    /// "Not found" is a valid `false`; only unreadable filesystem state is
    /// an error.
    pub fn exists(&self, id: &ArtifactId) -> Result<bool, PipelineError> {
        Ok(self.artifact(id)?.is_some())
    }

    /// The installed artifact, if present and recorded in the manifest
    pub fn artifact(&self, id: &ArtifactId) -> Result<Option<ModelArtifact>, PipelineError> {
        let path = self.artifact_path(id);
        let size = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::storage(
                    &format!("stat {}", path.display()),
                    e,
                ))
            }
        };

        let manifest = {
            let _guard = self.manifest_lock.lock();
            ArtifactManifest::load(&self.manifest_path())?
        };

        match manifest.get(id) {
            Some(entry) if entry.size_bytes == size => Ok(Some(ModelArtifact {
                id: id.clone(),
                path,
                size_bytes: size,
                sha256: entry.sha256.clone(),
                integrity: IntegrityStatus::Valid,
            })),
            Some(entry) => {
                warn!(
                    "Artifact {} is {} bytes on disk but {} recorded; treating as absent",
                    id, size, entry.size_bytes
                );
                Ok(None)
            }
            None => {
                debug!("Artifact {} present on disk but not recorded", id);
                Ok(None)
            }
        }
    }

    /// Move a fully written, verified file into its canonical location
    ///
    /// A same-filesystem rename is tried first. If it fails, the file is
    /// copied next to the destination, its size checked, and then renamed
    /// into place so readers never observe a partial file.
    pub fn publish(
        &self,
        temp_path: &Path,
        id: &ArtifactId,
        sha256: &str,
    ) -> Result<ModelArtifact, PipelineError> {
        self.ensure_directories()?;
        let destination = self.artifact_path(id);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::storage("create artifact directory", e))?;
        }

        let size = std::fs::metadata(temp_path)
            .map_err(|e| PipelineError::storage("stat downloaded file", e))?
            .len();

        if let Err(rename_err) = std::fs::rename(temp_path, &destination) {
            warn!(
                "Atomic rename of {:?} into place failed ({}); falling back to copy",
                temp_path, rename_err
            );
            self.copy_into_place(temp_path, &destination, size)?;
        }

        {
            let _guard = self.manifest_lock.lock();
            let mut manifest = ArtifactManifest::load(&self.manifest_path())?;
            manifest.upsert(ManifestEntry::new(id.clone(), size, sha256.to_string()));
            manifest.save(&self.manifest_path())?;
        }

        info!("Published {} ({} bytes) at {:?}", id, size, destination);
        Ok(ModelArtifact {
            id: id.clone(),
            path: destination,
            size_bytes: size,
            sha256: sha256.to_string(),
            integrity: IntegrityStatus::Valid,
        })
    }

    fn copy_into_place(
        &self,
        source: &Path,
        destination: &Path,
        expected_size: u64,
    ) -> Result<(), PipelineError> {
        let staging = destination.with_extension("incoming");
        let result = std::fs::copy(source, &staging)
            .map_err(|e| PipelineError::storage("copy artifact into model directory", e))
            .and_then(|copied| {
                if copied != expected_size {
                    return Err(PipelineError::Storage(format!(
                        "copied {copied} bytes, expected {expected_size}"
                    )));
                }
                std::fs::rename(&staging, destination)
                    .map_err(|e| PipelineError::storage("rename copied artifact into place", e))
            });

        if let Err(e) = result {
            if let Err(cleanup) = std::fs::remove_file(&staging) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove staging copy {:?}: {}", staging, cleanup);
                }
            }
            return Err(e);
        }

        if let Err(e) = std::fs::remove_file(source) {
            warn!("Failed to remove downloaded temp file {:?}: {}", source, e);
        }
        Ok(())
    }

    /// Remove an artifact; absent artifacts are not an error
    pub fn delete(&self, id: &ArtifactId) -> Result<(), PipelineError> {
        let path = self.artifact_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => info!("Deleted artifact {} at {:?}", id, path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PipelineError::storage(
                    &format!("delete {}", path.display()),
                    e,
                ))
            }
        }

        {
            let _guard = self.manifest_lock.lock();
            let mut manifest = ArtifactManifest::load(&self.manifest_path())?;
            if manifest.remove(id) {
                manifest.save(&self.manifest_path())?;
            }
        }

        if let Some(parent) = path.parent() {
            // only succeeds once the model directory is empty
            let _ = std::fs::remove_dir(parent);
        }
        Ok(())
    }

    /// Delete every scratch file in the cache directory
    ///
    /// Callers must make sure no download is in flight.
    pub fn purge_cache(&self) -> Result<usize, PipelineError> {
        let entries = match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PipelineError::storage("list cache directory", e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::storage("read cache entry", e))?;
            let path = entry.path();
            if path.is_file() {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to purge {:?}: {}", path, e),
                }
            }
        }

        debug!("Purged {} cache files", removed);
        Ok(removed)
    }

    /// Remove a scratch file, logging instead of failing
    pub(crate) fn discard_temp(&self, temp_path: &Path) {
        match std::fs::remove_file(temp_path) {
            Ok(()) => debug!("Discarded temp file {:?}", temp_path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {:?}: {}", temp_path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(dir.path().join("models"), dir.path().join("cache"))
    }

    fn write_temp(store: &ArtifactStore, id: &ArtifactId, data: &[u8]) -> PathBuf {
        store.ensure_directories().unwrap();
        let temp = store.temp_path(id);
        std::fs::write(&temp, data).unwrap();
        temp
    }

    #[test]
    fn test_absent_artifact_is_false_not_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        assert!(!store.exists(&id).unwrap());
    }

    #[test]
    fn test_publish_then_exists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        let temp = write_temp(&store, &id, b"weights");

        let artifact = store.publish(&temp, &id, "abc").unwrap();
        assert!(artifact.is_ready());
        assert_eq!(artifact.size_bytes, 7);
        assert!(!temp.exists());
        assert!(store.exists(&id).unwrap());
        assert_eq!(std::fs::read(store.artifact_path(&id)).unwrap(), b"weights");
    }

    #[test]
    fn test_unrecorded_file_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        let path = store.artifact_path(&id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"half-written").unwrap();

        assert!(!store.exists(&id).unwrap());
    }

    #[test]
    fn test_size_drift_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        let temp = write_temp(&store, &id, b"weights");
        store.publish(&temp, &id, "abc").unwrap();

        std::fs::write(store.artifact_path(&id), b"truncated!!").unwrap();
        assert!(!store.exists(&id).unwrap());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        let temp = write_temp(&store, &id, b"weights");
        store.publish(&temp, &id, "abc").unwrap();

        store.delete(&id).unwrap();
        assert!(!store.exists(&id).unwrap());
        store.delete(&id).unwrap();
        store.delete(&ArtifactId::new("never", "0", "x")).unwrap();
    }

    #[test]
    fn test_copy_fallback_places_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        let temp = write_temp(&store, &id, b"weights");
        let destination = store.artifact_path(&id);
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();

        store.copy_into_place(&temp, &destination, 7).unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"weights");
        assert!(!temp.exists());
        assert!(!destination.with_extension("incoming").exists());
    }

    #[test]
    fn test_copy_fallback_rejects_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        let temp = write_temp(&store, &id, b"weights");
        let destination = store.artifact_path(&id);
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();

        let err = store.copy_into_place(&temp, &destination, 99).unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert!(!destination.exists());
        assert!(temp.exists());
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ArtifactId::new("m", "1", "model.onnx");
        let a = store.temp_path(&id);
        let b = store.temp_path(&id);
        assert_ne!(a, b);
        assert!(a.starts_with(store.cache_dir()));
    }

    #[test]
    fn test_purge_cache() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.purge_cache().unwrap(), 0);

        let id = ArtifactId::new("m", "1", "model.onnx");
        write_temp(&store, &id, b"a");
        write_temp(&store, &id, b"b");
        assert_eq!(store.purge_cache().unwrap(), 2);
    }
}

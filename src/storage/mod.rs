//! Storage Layer
//!
//! Filesystem-backed storage for model artifacts and scratch files.

pub mod artifacts;
pub mod manifest;

use anyhow::Result;
use std::path::PathBuf;

pub use artifacts::ArtifactStore;
pub use manifest::{ArtifactManifest, ManifestEntry};

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "smolvlm", "SmolVLMNotes")
        .ok_or_else(|| anyhow::anyhow!("Could not determine application directories"))
}

/// Default directory holding canonical model artifacts
pub fn default_models_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("models"))
}

/// Default directory for downloads in progress and other scratch files
pub fn default_cache_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.cache_dir().to_path_buf())
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

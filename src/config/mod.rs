//! Pipeline Configuration
//!
//! Model identity, input contract and decoding settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{ArtifactId, DownloadRequest, IntegrityPolicy};

/// Environment variable forcing offline mode
pub const OFFLINE_ENV: &str = "SMOLVLM_NOTES_OFFLINE";

/// Pipeline settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Which model to fetch and how to verify it
    pub model: ModelSettings,
    /// Input tensor contract of the model
    pub input: InputSettings,
    /// Output decoding settings
    pub decode: DecodeSettings,
    /// Storage locations
    pub storage: StorageSettings,
    /// Download behaviour
    pub download: DownloadSettings,
}

/// Model identity and artifact sources
///
/// The model is one ONNX graph taking the image tensor and returning per-step
/// token scores. The default `model_url` points at `model.onnx` in the root of
/// the SmolVLM-Instruct repository, but that repository publishes the model as
/// split graphs (vision encoder, token embeddings, decoder) under `onnx/` and
/// has no root `model.onnx`, so the default download fails with 404. Export a
/// single end-to-end graph, host it and set `model_url` (plus `model_sha256`)
/// before running `init`. The default `vocab_url` (`tokenizer.json`) exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model name (Hugging Face repo id)
    pub name: String,
    /// Model revision
    pub version: String,
    /// URL of the single end-to-end ONNX graph
    pub model_url: String,
    /// File name of the ONNX graph in the model directory
    pub model_file: String,
    /// Known-good SHA-256 of the ONNX graph
    pub model_sha256: Option<String>,
    /// Plausible size bounds of the ONNX graph in bytes
    pub model_size_range: Option<(u64, u64)>,
    /// URL of the token vocabulary
    pub vocab_url: String,
    /// File name of the vocabulary (`*.json` is read as `tokenizer.json`)
    pub vocab_file: String,
    pub vocab_sha256: Option<String>,
    pub vocab_size_range: Option<(u64, u64)>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let name = "HuggingFaceTB/SmolVLM-Instruct".to_string();
        Self {
            model_url: format!("https://huggingface.co/{name}/resolve/main/model.onnx"),
            vocab_url: format!("https://huggingface.co/{name}/resolve/main/tokenizer.json"),
            name,
            version: "main".to_string(),
            model_file: "model.onnx".to_string(),
            model_sha256: None,
            // 100 MiB .. 2 GiB
            model_size_range: Some((100 * 1024 * 1024, 2 * 1024 * 1024 * 1024)),
            vocab_file: "tokenizer.json".to_string(),
            vocab_sha256: None,
            vocab_size_range: Some((1_000, 50 * 1024 * 1024)),
        }
    }
}

impl ModelSettings {
    pub fn model_id(&self) -> ArtifactId {
        ArtifactId::new(&self.name, &self.version, &self.model_file)
    }

    pub fn vocab_id(&self) -> ArtifactId {
        ArtifactId::new(&self.name, &self.version, &self.vocab_file)
    }

    /// Download request for the ONNX graph
    pub fn model_request(&self) -> DownloadRequest {
        DownloadRequest {
            id: self.model_id(),
            url: self.model_url.clone(),
            integrity: IntegrityPolicy {
                sha256: self.model_sha256.clone(),
                size_range: self.model_size_range,
            },
        }
    }

    /// Download request for the vocabulary
    pub fn vocab_request(&self) -> DownloadRequest {
        DownloadRequest {
            id: self.vocab_id(),
            url: self.vocab_url.clone(),
            integrity: IntegrityPolicy {
                sha256: self.vocab_sha256.clone(),
                size_range: self.vocab_size_range,
            },
        }
    }
}

/// Channel order expected by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Memory layout of the input tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, C, H, W]`
    #[default]
    Planar,
    /// `[1, H, W, C]`
    Interleaved,
}

/// Input tensor contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// Model input width in pixels
    pub width: u32,
    /// Model input height in pixels
    pub height: u32,
    pub channel_order: ChannelOrder,
    pub layout: TensorLayout,
    /// Per-channel mean subtracted after scaling to [0, 1]
    pub mean: [f32; 3],
    /// Per-channel std dividing after mean subtraction
    pub std: [f32; 3],
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            width: 384,
            height: 384,
            channel_order: ChannelOrder::Rgb,
            layout: TensorLayout::Planar,
            // plain divide-by-255: values land in [0, 1]
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
        }
    }
}

impl InputSettings {
    /// Range every normalized value falls into
    pub fn value_range(&self) -> (f32, f32) {
        let mut low = f32::INFINITY;
        let mut high = f32::NEG_INFINITY;
        for c in 0..3 {
            let a = (0.0 - self.mean[c]) / self.std[c];
            let b = (1.0 - self.mean[c]) / self.std[c];
            low = low.min(a.min(b));
            high = high.max(a.max(b));
        }
        (low, high)
    }
}

/// How the model's output scores should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    /// Raw scores; softmax is applied per step
    #[default]
    Logits,
    /// Scores are already probabilities
    Probabilities,
}

/// Output decoding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeSettings {
    /// Tokens that terminate the sequence
    pub eos_tokens: Vec<String>,
    /// Drop `<...>` control tokens from the text
    pub skip_special_tokens: bool,
    /// Maximum number of steps decoded
    pub max_tokens: usize,
    pub activation: OutputActivation,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            eos_tokens: vec![
                "<end_of_utterance>".to_string(),
                "</s>".to_string(),
                "<|im_end|>".to_string(),
            ],
            skip_special_tokens: true,
            max_tokens: 256,
            activation: OutputActivation::Logits,
        }
    }
}

/// Storage locations (defaults come from the platform's app directories)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub models_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

/// Download behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Seconds allowed to establish a connection
    pub connect_timeout_secs: u64,
    /// Seconds a transfer may go without receiving any bytes
    pub read_timeout_secs: u64,
    /// Never touch the network
    pub offline: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            offline: false,
        }
    }
}

impl DownloadSettings {
    /// Offline if configured or forced through the environment
    pub fn is_offline(&self) -> bool {
        self.offline || std::env::var_os(OFFLINE_ENV).is_some()
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: PipelineConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &PipelineConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();

        assert_eq!(config.model.name, "HuggingFaceTB/SmolVLM-Instruct");
        assert!(config.model.model_url.ends_with("/resolve/main/model.onnx"));
        assert_eq!(
            config.model.model_size_range,
            Some((104_857_600, 2_147_483_648))
        );

        assert_eq!(config.input.width, 384);
        assert_eq!(config.input.height, 384);
        assert_eq!(config.input.layout, TensorLayout::Planar);
        assert_eq!(config.input.value_range(), (0.0, 1.0));

        assert_eq!(config.decode.max_tokens, 256);
        assert!(config.decode.eos_tokens.contains(&"<end_of_utterance>".to_string()));
        assert!(!config.download.offline);
    }

    #[test]
    fn test_value_range_with_mean_std() {
        let input = InputSettings {
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            ..Default::default()
        };
        assert_eq!(input.value_range(), (-1.0, 1.0));
    }

    #[test]
    fn test_requests_carry_integrity() {
        let mut model = ModelSettings::default();
        model.model_sha256 = Some("abc".to_string());

        let request = model.model_request();
        assert_eq!(request.id, model.model_id());
        assert_eq!(request.integrity.sha256.as_deref(), Some("abc"));
        assert_eq!(request.integrity.size_range, model.model_size_range);
        assert_eq!(model.vocab_request().id.file_name, "tokenizer.json");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
            [input]
            width = 224
            height = 224
            channel_order = "bgr"

            [download]
            offline = true
            "#,
        )
        .unwrap();

        assert_eq!(parsed.input.width, 224);
        assert_eq!(parsed.input.channel_order, ChannelOrder::Bgr);
        assert_eq!(parsed.input.std, [1.0, 1.0, 1.0]);
        assert!(parsed.download.offline);
        assert_eq!(parsed.download.read_timeout_secs, 120);
        assert_eq!(parsed.model.version, "main");
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = PipelineConfig::default();
        config.model.version = "v2".to_string();
        config.decode.activation = OutputActivation::Probabilities;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();

        let loaded = load_config(temp_file.path()).unwrap();
        assert_eq!(loaded.model.version, "v2");
        assert_eq!(loaded.decode.activation, OutputActivation::Probabilities);
        assert_eq!(loaded.input, config.input);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}

//! Token decoding
//!
//! Greedy decoding of the model's per-step scores into text using the
//! vocabulary shipped next to the model.

use std::collections::HashSet;
use std::path::Path;

use tokenizers::decoders::byte_level::ByteLevel;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::{DecodeSettings, OutputActivation};
use crate::error::PipelineError;

/// Raw model output: a row of scores per decoding step
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Token id to text mapping
#[derive(Debug, Clone)]
pub enum Vocabulary {
    /// `vocab.txt`, one SentencePiece token per line
    Pieces(Vec<String>),
    /// A Hugging Face `tokenizer.json`
    Tokenizer(Box<Tokenizer>),
}

impl Vocabulary {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Pieces(tokens.into_iter().map(Into::into).collect())
    }

    /// Load `vocab.txt` or `tokenizer.json`
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let vocab = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_tokenizer_file(path)?
        } else {
            let content = std::fs::read_to_string(path).map_err(|e| {
                PipelineError::ModelLoad(format!(
                    "failed to read vocabulary {}: {e}",
                    path.display()
                ))
            })?;
            Self::from_tokens(content.lines())
        };

        if vocab.is_empty() {
            return Err(PipelineError::ModelLoad(format!(
                "vocabulary {} is empty",
                path.display()
            )));
        }
        info!("Loaded vocabulary with {} tokens", vocab.len());
        Ok(vocab)
    }

    /// Load a `tokenizer.json`, falling back to a byte-level decoder when the
    /// file declares none
    pub fn from_tokenizer_file(path: &Path) -> Result<Self, PipelineError> {
        let mut tokenizer = Tokenizer::from_file(path).map_err(|e| {
            PipelineError::ModelLoad(format!("invalid tokenizer {}: {e}", path.display()))
        })?;
        if tokenizer.get_decoder().is_none() {
            tokenizer.with_decoder(Some(ByteLevel::default()));
        }
        Ok(Self::Tokenizer(Box::new(tokenizer)))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Pieces(tokens) => tokens.len(),
            Self::Tokenizer(tokenizer) => tokenizer.get_vocab_size(true),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: usize) -> Option<String> {
        match self {
            Self::Pieces(tokens) => tokens.get(id).cloned(),
            Self::Tokenizer(tokenizer) => {
                u32::try_from(id).ok().and_then(|id| tokenizer.id_to_token(id))
            }
        }
    }

    pub fn id_of(&self, token: &str) -> Option<usize> {
        match self {
            Self::Pieces(tokens) => tokens.iter().position(|t| t == token),
            Self::Tokenizer(tokenizer) => tokenizer.token_to_id(token).map(|id| id as usize),
        }
    }

    /// Join the chosen tokens into text
    pub fn detokenize(
        &self,
        ids: &[u32],
        skip_special_tokens: bool,
    ) -> Result<String, PipelineError> {
        match self {
            Self::Tokenizer(tokenizer) => {
                tokenizer.decode(ids, skip_special_tokens).map_err(|e| {
                    PipelineError::InferenceExecution(format!("tokenizer decode failed: {e}"))
                })
            }
            Self::Pieces(tokens) => {
                let mut bytes = Vec::new();
                for token in ids.iter().filter_map(|&id| tokens.get(id as usize)) {
                    match byte_token(token) {
                        Some(byte) => bytes.push(byte),
                        None => {
                            bytes.extend_from_slice(token.replace('\u{2581}', " ").as_bytes())
                        }
                    }
                }
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }
}

/// Text recovered from one model output
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedText {
    pub text: String,
    /// Mean probability of the chosen tokens, in [0, 1]
    pub confidence: f32,
    /// Number of decoding steps consumed
    pub steps: usize,
}

/// Greedy decoder over a fixed vocabulary
#[derive(Debug, Clone)]
pub struct TokenDecoder {
    vocab: Vocabulary,
    eos_ids: HashSet<usize>,
    settings: DecodeSettings,
}

impl TokenDecoder {
    pub fn new(vocab: Vocabulary, settings: DecodeSettings) -> Self {
        let eos_ids: HashSet<usize> = settings
            .eos_tokens
            .iter()
            .filter_map(|token| vocab.id_of(token))
            .collect();
        if eos_ids.is_empty() {
            debug!("None of the end-of-sequence tokens are in the vocabulary");
        }
        Self {
            vocab,
            eos_ids,
            settings,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Decode `[1, steps, vocab]` or `[steps, vocab]` scores
    pub fn decode(&self, output: &ModelOutput) -> Result<DecodedText, PipelineError> {
        let (steps, width) = match output.shape.as_slice() {
            [1, steps, width] => (*steps, *width),
            [steps, width] => (*steps, *width),
            other => {
                return Err(PipelineError::InferenceExecution(format!(
                    "unexpected output shape {other:?}"
                )))
            }
        };
        if output.data.len() != steps * width {
            return Err(PipelineError::InferenceExecution(format!(
                "output holds {} values, shape {:?} needs {}",
                output.data.len(),
                output.shape,
                steps * width
            )));
        }
        if width == 0 || width < self.vocab.len() {
            return Err(PipelineError::InferenceExecution(format!(
                "output width {width} is smaller than the vocabulary ({})",
                self.vocab.len()
            )));
        }

        let mut ids = Vec::new();
        let mut probabilities = Vec::new();

        for row in output.data.chunks(width).take(self.settings.max_tokens) {
            let (id, probability) = self.pick(row)?;

            if self.eos_ids.contains(&id) {
                probabilities.push(probability);
                break;
            }
            // ids past the vocabulary are padding
            let Some(token) = self.vocab.get(id) else {
                continue;
            };
            if self.settings.skip_special_tokens && is_special(&token) {
                continue;
            }
            probabilities.push(probability);
            ids.push(id as u32);
        }
        let text = self.vocab.detokenize(&ids, self.settings.skip_special_tokens)?;

        let confidence = if probabilities.is_empty() {
            0.0
        } else {
            let sum: f32 = probabilities.iter().sum();
            (sum / probabilities.len() as f32).clamp(0.0, 1.0)
        };

        Ok(DecodedText {
            text: tidy(&text),
            confidence,
            steps: probabilities.len(),
        })
    }

    /// Argmax of one row and its probability
    fn pick(&self, row: &[f32]) -> Result<(usize, f32), PipelineError> {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (id, score) in row.iter().enumerate() {
            if !score.is_finite() {
                return Err(PipelineError::InferenceExecution(
                    "model produced non-finite scores".to_string(),
                ));
            }
            if *score > best_score {
                best = id;
                best_score = *score;
            }
        }

        let probability = match self.settings.activation {
            OutputActivation::Probabilities => best_score.clamp(0.0, 1.0),
            OutputActivation::Logits => {
                let denominator: f32 = row.iter().map(|s| (s - best_score).exp()).sum();
                1.0 / denominator
            }
        };
        Ok((best, probability))
    }
}

/// `<...>` control tokens, byte fallback tokens excluded
fn is_special(token: &str) -> bool {
    token.len() > 2
        && token.starts_with('<')
        && token.ends_with('>')
        && byte_token(token).is_none()
}

/// Byte fallback tokens such as `<0x0A>`
fn byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}

/// Trim every line and the text as a whole
fn tidy(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn decoder(tokens: &[&str]) -> TokenDecoder {
        TokenDecoder::new(
            Vocabulary::from_tokens(tokens.iter().copied()),
            DecodeSettings::default(),
        )
    }

    /// One-hot-ish logits where `ids[i]` wins step `i`
    fn logits(ids: &[usize], width: usize) -> ModelOutput {
        let mut data = vec![0.0; ids.len() * width];
        for (step, id) in ids.iter().enumerate() {
            data[step * width + id] = 10.0;
        }
        ModelOutput {
            shape: vec![1, ids.len(), width],
            data,
        }
    }

    #[test]
    fn test_greedy_decode_stops_at_eos() {
        let decoder = decoder(&["<end_of_utterance>", "\u{2581}Hello", "\u{2581}world", "!"]);
        let decoded = decoder.decode(&logits(&[1, 2, 3, 0, 1], 4)).unwrap();

        assert_eq!(decoded.text, "Hello world!");
        assert_eq!(decoded.steps, 4);
        assert!(decoded.confidence > 0.99 && decoded.confidence <= 1.0);
    }

    #[test]
    fn test_softmax_confidence() {
        let decoder = decoder(&["a", "b"]);
        let output = ModelOutput {
            shape: vec![1, 2],
            data: vec![0.0, 0.0],
        };
        let decoded = decoder.decode(&output).unwrap();
        assert!((decoded.confidence - 0.5).abs() < 1e-6);
        assert_eq!(decoded.text, "a");
    }

    #[test]
    fn test_probability_outputs_are_not_softmaxed() {
        let settings = DecodeSettings {
            activation: OutputActivation::Probabilities,
            ..Default::default()
        };
        let decoder = TokenDecoder::new(Vocabulary::from_tokens(["x", "y"]), settings);
        let output = ModelOutput {
            shape: vec![2, 2],
            data: vec![0.8, 0.2, 0.4, 0.6],
        };
        let decoded = decoder.decode(&output).unwrap();
        assert_eq!(decoded.text, "xy");
        assert!((decoded.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_special_and_byte_tokens() {
        let decoder = decoder(&["<image>", "Title", "<0x0A>", "\u{2581}body", "end"]);
        let decoded = decoder.decode(&logits(&[0, 1, 2, 3, 2, 4], 5)).unwrap();
        assert_eq!(decoded.text, "Title\nbody\nend");
        // skipped control token does not count
        assert_eq!(decoded.steps, 5);
    }

    #[test]
    fn test_multibyte_byte_tokens() {
        let decoder = decoder(&["<end_of_utterance>", "\u{2581}caf", "<0xC3>", "<0xA9>"]);
        let decoded = decoder.decode(&logits(&[1, 2, 3, 0], 4)).unwrap();
        assert_eq!(decoded.text, "café");
        assert_eq!(decoded.steps, 4);
    }

    #[test]
    fn test_tokenizer_json_decodes_byte_level_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, tokenizer_json()).unwrap();

        let settings = DecodeSettings {
            eos_tokens: vec!["<|endoftext|>".to_string()],
            ..Default::default()
        };
        let decoder = TokenDecoder::new(Vocabulary::from_file(&path).unwrap(), settings);
        let decoded = decoder.decode(&logits(&[0, 1, 2, 3, 4], 5)).unwrap();

        assert_eq!(decoded.text, "café • notes");
        assert_eq!(decoded.steps, 5);
    }

    #[test]
    fn test_max_tokens_limits_steps() {
        let settings = DecodeSettings {
            max_tokens: 2,
            ..Default::default()
        };
        let decoder = TokenDecoder::new(Vocabulary::from_tokens(["a", "b"]), settings);
        let decoded = decoder.decode(&logits(&[0, 1, 0, 1], 2)).unwrap();
        assert_eq!(decoded.text, "ab");
    }

    #[test]
    fn test_shape_mismatches_are_errors() {
        let decoder = decoder(&["a", "b", "c"]);

        let narrow = logits(&[0, 1], 2);
        assert!(matches!(
            decoder.decode(&narrow),
            Err(PipelineError::InferenceExecution(_))
        ));

        let ragged = ModelOutput {
            shape: vec![1, 2, 3],
            data: vec![0.0; 5],
        };
        assert!(decoder.decode(&ragged).is_err());

        let rank4 = ModelOutput {
            shape: vec![1, 1, 1, 3],
            data: vec![0.0; 3],
        };
        assert!(decoder.decode(&rank4).is_err());

        let nan = ModelOutput {
            shape: vec![1, 3],
            data: vec![0.0, f32::NAN, 1.0],
        };
        assert!(decoder.decode(&nan).is_err());
    }

    #[test]
    fn test_empty_output_has_zero_confidence() {
        let decoder = decoder(&["a"]);
        let decoded = decoder
            .decode(&ModelOutput {
                shape: vec![1, 0, 1],
                data: vec![],
            })
            .unwrap();
        assert_eq!(decoded.text, "");
        assert_eq!(decoded.confidence, 0.0);
    }

    /// Byte-level BPE tokenizer without merges
    fn tokenizer_json() -> &'static str {
        r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {
                    "id": 4,
                    "content": "<|endoftext|>",
                    "single_word": false,
                    "lstrip": false,
                    "rstrip": false,
                    "normalized": false,
                    "special": true
                }
            ],
            "normalizer": null,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": {
                "type": "ByteLevel",
                "add_prefix_space": true,
                "trim_offsets": true,
                "use_regex": true
            },
            "model": {
                "type": "BPE",
                "dropout": null,
                "unk_token": null,
                "continuing_subword_prefix": null,
                "end_of_word_suffix": null,
                "fuse_unk": false,
                "byte_fallback": false,
                "vocab": { "caf": 0, "Ã©": 1, "ĠâĢ¢": 2, "Ġnotes": 3 },
                "merges": []
            }
        }"#
    }

    #[test]
    fn test_vocabulary_files() {
        let dir = TempDir::new().unwrap();

        let txt = dir.path().join("vocab.txt");
        std::fs::write(&txt, "<pad>\nhello\nworld\n").unwrap();
        let vocab = Vocabulary::from_file(&txt).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.get(1).as_deref(), Some("hello"));

        let json = dir.path().join("tokenizer.json");
        std::fs::write(&json, tokenizer_json()).unwrap();
        let vocab = Vocabulary::from_file(&json).unwrap();
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.get(3).as_deref(), Some("Ġnotes"));
        assert_eq!(vocab.id_of("<|endoftext|>"), Some(4));

        let corrupt = dir.path().join("broken.json");
        std::fs::write(&corrupt, r#"{ "model": { "vocab": {"#).unwrap();
        assert!(matches!(
            Vocabulary::from_file(&corrupt),
            Err(PipelineError::ModelLoad(_))
        ));

        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(
            Vocabulary::from_file(&empty),
            Err(PipelineError::ModelLoad(_))
        ));
    }

    #[test]
    fn test_huge_added_token_id_is_not_a_table_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(
            &path,
            tokenizer_json().replace(r#""id": 4,"#, r#""id": 4000000000,"#),
        )
        .unwrap();

        match Vocabulary::from_file(&path) {
            Ok(vocab) => assert!(vocab.len() < 16, "{} tokens", vocab.len()),
            Err(e) => assert!(matches!(e, PipelineError::ModelLoad(_))),
        }
    }
}

use std::path::Path;

use serde::Serialize;
use tokenizers::Tokenizer;

use crate::{error::ServiceError, model::ModelConfig, sampling::SamplerSettings};

/// Tokenizer flags a prompt format asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeOptions {
    pub add_bos: bool,
    pub add_eos: bool,
    /// Recognise special-token markup such as `<|im_end|>` inside raw text.
    pub encode_special_tokens: bool,
}

/// Ends generation when seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum StopCondition {
    Token(u32),
    Text(String),
}

pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str, options: EncodeOptions) -> Result<Vec<u32>, ServiceError>;

    fn decode(&self, ids: &[u32]) -> Result<String, ServiceError>;

    /// Id of `piece` when it maps to exactly one token.
    fn single_token_id(&self, piece: &str) -> Option<u32>;

    fn eos_token_id(&self) -> Option<u32>;
}

/// Everything the engine needs for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationJob<'a> {
    pub prompt: &'a str,
    pub settings: &'a SamplerSettings,
    pub max_new_tokens: usize,
    pub stop_conditions: &'a [StopCondition],
    pub encode_options: EncodeOptions,
}

/// Weights, cache and tokenizer held together for as long as the model is
/// loaded.
pub trait LoadedModel: Send + Sync {
    fn tokenizer(&self) -> &dyn TextTokenizer;

    /// Returns the continuation only; the prompt is not echoed.
    fn generate(&self, job: &GenerationJob<'_>) -> Result<String, ServiceError>;
}

pub trait InferenceEngine: Send + Sync {
    fn load(&self, config: &ModelConfig) -> Result<Box<dyn LoadedModel>, ServiceError>;
}

/// Cuts `text` at the earliest textual stop condition. Returns whether one
/// was found.
pub fn truncate_at_stop(text: &mut String, stops: &[StopCondition]) -> bool {
    let earliest = stops
        .iter()
        .filter_map(|stop| match stop {
            StopCondition::Text(needle) if !needle.is_empty() => text.find(needle.as_str()),
            _ => None,
        })
        .min();
    match earliest {
        Some(at) => {
            text.truncate(at);
            true
        }
        None => false,
    }
}

/// Adapter over a Hugging Face `tokenizer.json`.
pub struct HfTokenizer {
    // `set_encode_special_tokens(true)` makes the tokenizer treat markup like
    // `<|im_end|>` as ordinary text.
    literal: Tokenizer,
    markup: Tokenizer,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
}

impl HfTokenizer {
    pub fn new(tokenizer: Tokenizer, bos_token_id: Option<u32>, eos_token_id: Option<u32>) -> Self {
        let mut literal = tokenizer.clone();
        literal.set_encode_special_tokens(true);
        let mut markup = tokenizer;
        markup.set_encode_special_tokens(false);
        Self {
            literal,
            markup,
            bos_token_id,
            eos_token_id,
        }
    }

    /// Reads `tokenizer.json` from the model directory and the bos/eos ids
    /// from the model's metadata file.
    pub fn from_model_dir(config: &ModelConfig) -> Result<Self, ServiceError> {
        let tokenizer = Tokenizer::from_file(config.path.join("tokenizer.json"))
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let (bos, eos) = special_ids_from_metadata(&config.metadata_path())?;
        Ok(Self::new(tokenizer, bos, eos))
    }
}

fn special_ids_from_metadata(path: &Path) -> Result<(Option<u32>, Option<u32>), ServiceError> {
    let raw = std::fs::read_to_string(path)?;
    let metadata: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| ServiceError::InvalidConfig(format!("{}: {e}", path.display())))?;

    // Some configs list several eos ids; the first one is canonical.
    let id = |key: &str| {
        let raw = match metadata.get(key) {
            Some(serde_json::Value::Array(ids)) => ids.first().and_then(|v| v.as_u64()),
            Some(value) => value.as_u64(),
            None => None,
        };
        raw.map(|id| id as u32)
    };

    Ok((id("bos_token_id"), id("eos_token_id")))
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, options: EncodeOptions) -> Result<Vec<u32>, ServiceError> {
        let tokenizer = if options.encode_special_tokens {
            &self.markup
        } else {
            &self.literal
        };
        let encoding = tokenizer
            .encode(text, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        let mut ids = Vec::with_capacity(encoding.get_ids().len() + 2);
        if options.add_bos {
            ids.extend(self.bos_token_id);
        }
        ids.extend_from_slice(encoding.get_ids());
        if options.add_eos {
            ids.extend(self.eos_token_id);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
        self.markup
            .decode(ids, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    fn single_token_id(&self, piece: &str) -> Option<u32> {
        self.markup.token_to_id(piece)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokenizers::{AddedToken, models::wordlevel::WordLevel};

    use super::*;

    fn word_level() -> Tokenizer {
        let vocab: HashMap<String, u32> = [("<unk>", 0), ("<s>", 1), ("</s>", 2), ("hello", 3)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        Tokenizer::new(model)
    }

    #[test]
    fn adds_sequence_markers_on_request() {
        let tokenizer = HfTokenizer::new(word_level(), Some(1), Some(2));

        let bare = tokenizer.encode("hello", EncodeOptions::default()).unwrap();
        assert_eq!(bare, vec![3]);

        let wrapped = tokenizer
            .encode(
                "hello",
                EncodeOptions {
                    add_bos: true,
                    add_eos: true,
                    encode_special_tokens: false,
                },
            )
            .unwrap();
        assert_eq!(wrapped, vec![1, 3, 2]);
    }

    #[test]
    fn missing_markers_are_skipped() {
        let tokenizer = HfTokenizer::new(word_level(), None, None);
        let ids = tokenizer
            .encode(
                "hello",
                EncodeOptions {
                    add_bos: true,
                    add_eos: true,
                    encode_special_tokens: false,
                },
            )
            .unwrap();
        assert_eq!(ids, vec![3]);
        assert_eq!(tokenizer.eos_token_id(), None);
    }

    #[test]
    fn markup_is_split_out_only_when_requested() {
        let mut inner = word_level();
        inner.add_special_tokens(&[AddedToken::from("</s>", true)]);
        let tokenizer = HfTokenizer::new(inner, Some(1), Some(2));

        let markup = tokenizer
            .encode(
                "hello</s>",
                EncodeOptions {
                    encode_special_tokens: true,
                    ..EncodeOptions::default()
                },
            )
            .unwrap();
        assert_eq!(markup, vec![3, 2]);

        let literal = tokenizer
            .encode("hello</s>", EncodeOptions::default())
            .unwrap();
        assert!(!literal.contains(&2));
    }

    #[test]
    fn looks_up_single_tokens() {
        let tokenizer = HfTokenizer::new(word_level(), Some(1), Some(2));
        assert_eq!(tokenizer.single_token_id("</s>"), Some(2));
        assert_eq!(tokenizer.single_token_id("<|eot_id|>"), None);
    }

    #[test]
    fn truncates_at_earliest_stop_string() {
        let stops = vec![
            StopCondition::Token(2),
            StopCondition::Text("User:".into()),
            StopCondition::Text("<|im_end|>".into()),
        ];
        let mut text = "Sure.<|im_end|>\nUser: more".to_string();
        assert!(truncate_at_stop(&mut text, &stops));
        assert_eq!(text, "Sure.");

        let mut untouched = "no stop here".to_string();
        assert!(!truncate_at_stop(&mut untouched, &stops));
        assert_eq!(untouched, "no stop here");
    }

    #[test]
    fn reads_special_ids_from_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"bos_token_id": 128000, "eos_token_id": [128001, 128009]}"#)
            .unwrap();
        assert_eq!(
            special_ids_from_metadata(&path).unwrap(),
            (Some(128000), Some(128001))
        );
    }
}

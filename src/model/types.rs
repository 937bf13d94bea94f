use serde::{Deserialize, Serialize};

use crate::{model::ModelConfig, sampling::SamplerSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(flatten)]
    pub settings: SamplerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub output: String,
    pub formatted_prompt: String,
    pub tok_per_sec: f64,
    pub model: String,
    pub generation_time: f64,
}

#[derive(Debug, Deserialize)]
pub struct TokenizeQuery {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenizeResponse {
    pub encoded_text: Vec<u32>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub model_name_short: String,
    pub max_context_length: usize,
    pub prompt_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_name_short: String,
    pub model: String,
    pub weight_format: String,
    pub prompt_format: String,
    pub max_context_length: usize,
}

impl From<&ModelConfig> for ModelSummary {
    fn from(config: &ModelConfig) -> Self {
        Self {
            model_name_short: config.short_name.clone(),
            model: config.model_name(),
            weight_format: config.weight_format.clone(),
            prompt_format: config.prompt_format.clone(),
            max_context_length: config.max_context_length,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub status: String,
}

/// Tokens per second as reported to clients: one extra token accounts for
/// the stop token that ended generation.
pub fn throughput(output_tokens: usize, elapsed_secs: f64) -> f64 {
    let tokens = (output_tokens + 1) as f64;
    let rate = if elapsed_secs > 0.0 {
        tokens / elapsed_secs
    } else {
        tokens
    };
    round_to(rate, 1)
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

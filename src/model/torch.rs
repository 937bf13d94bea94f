use std::{collections::HashSet, env, path::Path};

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tracing::debug;

use crate::{
    error::ServiceError,
    model::{
        GenerationJob, HfTokenizer, InferenceEngine, LoadedModel, ModelConfig, StopCondition,
        TextTokenizer, truncate_at_stop,
    },
    sampling::LogitsProcessor,
};

pub const MODULE_FILE_NAME: &str = "model.ts";

/// Loads `model.ts`, a traced causal LM returning logits (or a tuple starting
/// with logits), from the model directory next to `tokenizer.json`.
pub struct TorchEngine {
    device: Device,
}

impl TorchEngine {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Picks the device from `DEVICE` (`cpu`, `cuda`, `cuda:1`, ...).
    pub fn from_env() -> Self {
        let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
        Self::new(parse_device(&raw))
    }
}

impl InferenceEngine for TorchEngine {
    fn load(&self, config: &ModelConfig) -> Result<Box<dyn LoadedModel>, ServiceError> {
        let module_path = config.path.join(MODULE_FILE_NAME);
        let tokenizer = HfTokenizer::from_model_dir(config)?;
        let model = TorchModel::new(&module_path, self.device, tokenizer, config.max_context_length)?;
        Ok(Box::new(model))
    }
}

pub struct TorchModel {
    device: Device,
    max_context_length: usize,
    tokenizer: HfTokenizer,
    module: Mutex<tch::CModule>,
}

impl TorchModel {
    pub fn new(
        module_path: &Path,
        device: Device,
        tokenizer: HfTokenizer,
        max_context_length: usize,
    ) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::InvalidConfig(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::Generation(e.to_string()))?;
        module.set_eval();

        Ok(Self {
            device,
            max_context_length,
            tokenizer,
            module: Mutex::new(module),
        })
    }

    fn next_logits(&self, module: &tch::CModule, ids: &[u32]) -> Result<Vec<f32>, ServiceError> {
        let input: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        let input_tensor = Tensor::from_slice(&input)
            .reshape([1, input.len() as i64])
            .to(self.device);

        let output = module
            .forward_is(&[IValue::Tensor(input_tensor)])
            .map_err(|e| ServiceError::Generation(e.to_string()))?;

        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(ServiceError::Generation(
                        "expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => {
                return Err(ServiceError::Generation(
                    "unexpected model output format".into(),
                ));
            }
        };

        // [1, seq_len, vocab] -> [vocab]
        let last = logits
            .select(1, -1)
            .squeeze()
            .to_kind(Kind::Float)
            .to(Device::Cpu);
        Vec::<f32>::try_from(&last).map_err(|e| ServiceError::Generation(e.to_string()))
    }
}

impl LoadedModel for TorchModel {
    fn tokenizer(&self) -> &dyn TextTokenizer {
        &self.tokenizer
    }

    fn generate(&self, job: &GenerationJob<'_>) -> Result<String, ServiceError> {
        let mut ids = self.tokenizer.encode(job.prompt, job.encode_options)?;
        if ids.is_empty() {
            return Err(ServiceError::BadRequest("prompt encodes to no tokens".into()));
        }
        let prompt_len = ids.len();

        let unsupported = job.settings.unsupported_knobs();
        if !unsupported.is_empty() {
            debug!(?unsupported, "sampler knobs ignored by the torch engine");
        }

        let stop_tokens: HashSet<u32> = job
            .stop_conditions
            .iter()
            .filter_map(|stop| match stop {
                StopCondition::Token(id) => Some(*id),
                StopCondition::Text(_) => None,
            })
            .collect();
        let has_text_stops = job
            .stop_conditions
            .iter()
            .any(|stop| matches!(stop, StopCondition::Text(_)));

        let mut processor = LogitsProcessor::new(job.settings.clone(), None);
        let budget = job
            .max_new_tokens
            .min(self.max_context_length.saturating_sub(prompt_len));

        let completion = no_grad(|| {
            let module = self.module.lock();

            for _ in 0..budget {
                let logits = self.next_logits(&module, &ids)?;
                let next = processor.sample(&logits, &ids)?;
                if stop_tokens.contains(&next) {
                    break;
                }
                ids.push(next);

                if has_text_stops {
                    let mut text = self.tokenizer.decode(&ids[prompt_len..])?;
                    if truncate_at_stop(&mut text, job.stop_conditions) {
                        return Ok(text);
                    }
                }
            }

            self.tokenizer.decode(&ids[prompt_len..])
        })?;

        debug!(
            prompt_tokens = prompt_len,
            generated_tokens = ids.len() - prompt_len,
            "generation finished"
        );
        Ok(completion)
    }
}

fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

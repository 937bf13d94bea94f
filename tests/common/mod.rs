#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use locllm_service::{
    ModelConfig, ServiceError,
    model::{EncodeOptions, GenerationJob, InferenceEngine, LoadedModel, StopCondition, TextTokenizer},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const BOS: u32 = 1;
pub const EOS: u32 = 2;
pub const IM_END: u32 = 32000;

/// Byte-level tokenizer: every byte of the text becomes one id offset past
/// the reserved range.
pub struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str, options: EncodeOptions) -> Result<Vec<u32>, ServiceError> {
        let mut ids = Vec::new();
        if options.add_bos {
            ids.push(BOS);
        }
        ids.extend(text.bytes().map(|b| b as u32 + 3));
        if options.add_eos {
            ids.push(EOS);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|id| **id >= 3 && **id < 259)
            .map(|id| (*id - 3) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn single_token_id(&self, piece: &str) -> Option<u32> {
        (piece == "<|im_end|>").then_some(IM_END)
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedJob {
    pub prompt: String,
    pub max_new_tokens: usize,
    pub stop_conditions: Vec<StopCondition>,
    pub temperature: f32,
    pub top_k: u32,
}

/// Parks `generate` until the test releases it.
pub struct Gate {
    entered: mpsc::UnboundedSender<()>,
    release: Mutex<mpsc::UnboundedReceiver<()>>,
}

pub struct GateHandle {
    pub entered: mpsc::UnboundedReceiver<()>,
    pub release: mpsc::UnboundedSender<()>,
}

#[derive(Default)]
pub struct Shared {
    pub loads: AtomicUsize,
    pub generations: AtomicUsize,
    pub fail_loads: AtomicBool,
    pub fail_generations: AtomicBool,
    pub last_job: Mutex<Option<RecordedJob>>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl Shared {
    pub fn install_gate(&self) -> GateHandle {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        *self.gate.lock() = Some(Arc::new(Gate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        }));
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn remove_gate(&self) {
        self.gate.lock().take();
    }
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    pub shared: Arc<Shared>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> usize {
        self.shared.loads.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.shared.generations.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn load(&self, _config: &ModelConfig) -> Result<Box<dyn LoadedModel>, ServiceError> {
        if self.shared.fail_loads.load(Ordering::SeqCst) {
            return Err(ServiceError::InvalidConfig("weights are corrupt".into()));
        }
        let generation = self.shared.loads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedModel {
            generation,
            tokenizer: ByteTokenizer,
            shared: self.shared.clone(),
        }))
    }
}

pub struct ScriptedModel {
    generation: usize,
    tokenizer: ByteTokenizer,
    shared: Arc<Shared>,
}

impl LoadedModel for ScriptedModel {
    fn tokenizer(&self) -> &dyn TextTokenizer {
        &self.tokenizer
    }

    fn generate(&self, job: &GenerationJob<'_>) -> Result<String, ServiceError> {
        self.shared.generations.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_job.lock() = Some(RecordedJob {
            prompt: job.prompt.to_string(),
            max_new_tokens: job.max_new_tokens,
            stop_conditions: job.stop_conditions.to_vec(),
            temperature: job.settings.temperature,
            top_k: job.settings.top_k,
        });

        let gate = self.shared.gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            gate.release.lock().blocking_recv();
        }

        if self.shared.fail_generations.load(Ordering::SeqCst) {
            return Err(ServiceError::Generation("engine exploded".into()));
        }
        Ok(format!("reply from load {}", self.generation))
    }
}

pub fn demo_config() -> ModelConfig {
    ModelConfig {
        short_name: "demo".into(),
        path: PathBuf::from("/models/demo-7b-exl2"),
        weight_format: "exl2".into(),
        prompt_format: "plain".into(),
        config_fname: "config.json".into(),
        max_context_length: 4096,
    }
}

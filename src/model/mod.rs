mod engine;
mod manager;
pub mod registry;
mod types;

#[cfg(feature = "tch-backend")]
pub mod torch;

pub use engine::{
    EncodeOptions, GenerationJob, HfTokenizer, InferenceEngine, LoadedModel, StopCondition,
    TextTokenizer, truncate_at_stop,
};
pub use manager::{DEFAULT_MAX_NEW_TOKENS, ModelLease, ModelManager, WeightFormat};
pub use registry::{ConfigSource, ModelConfig, ModelEntry, RegistryDocument};
pub use types::{
    GenerateRequest, GenerateResponse, ModelInfo, ModelSummary, ModelsResponse, ReloadResponse,
    TokenizeQuery, TokenizeResponse, round_to, throughput,
};

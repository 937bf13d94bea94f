pub mod config;
pub mod error;
pub mod model;
pub mod prompt;
pub mod sampling;
pub mod server;

pub use config::{AppConfig, ReloadPolicy};
pub use error::ServiceError;
pub use model::{GenerateRequest, GenerateResponse, InferenceEngine, ModelConfig, ModelManager};
pub use prompt::PromptFormat;
pub use sampling::SamplerSettings;
pub use server::build_router;

use std::{fmt, str::FromStr, sync::Arc, time::Instant};

use tokio::{
    sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock},
    task,
};
use tracing::{info, warn};

use crate::{
    config::ReloadPolicy,
    error::ServiceError,
    model::{
        ConfigSource, GenerationJob, InferenceEngine, LoadedModel, ModelConfig, StopCondition,
        registry,
    },
    prompt::PromptFormat,
    sampling::SamplerSettings,
};

/// Used by [`ModelManager::generate`] when the caller has no preference.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Exl2,
}

impl WeightFormat {
    pub const SUPPORTED: &'static [WeightFormat] = &[WeightFormat::Exl2];

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightFormat::Exl2 => "exl2",
        }
    }
}

impl fmt::Display for WeightFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightFormat {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|format| format.as_str() == raw)
            .ok_or_else(|| {
                let supported: Vec<_> = Self::SUPPORTED.iter().map(|f| f.as_str()).collect();
                ServiceError::InvalidConfig(format!(
                    "{raw} not supported. Must be one of: {}",
                    supported.join(",")
                ))
            })
    }
}

struct LoadedState {
    model: Box<dyn LoadedModel>,
    stop_conditions: Vec<StopCondition>,
}

/// Owns the single loaded model of the process.
///
/// Generation, tokenization and info calls hold a shared lease on the loaded
/// state for their whole duration. `reload` needs the exclusive lease, so it
/// never tears a model down underneath an in-flight call; depending on the
/// [`ReloadPolicy`] it either waits for outstanding leases or fails with
/// [`ServiceError::ReloadInProgress`].
pub struct ModelManager {
    config: ModelConfig,
    model_name: String,
    weight_format: WeightFormat,
    prompt_format: &'static PromptFormat,
    engine: Arc<dyn InferenceEngine>,
    reload_policy: ReloadPolicy,
    state: Arc<RwLock<Option<LoadedState>>>,
    // Serializes load/reload/unload against each other.
    lifecycle: Mutex<()>,
}

impl ModelManager {
    /// Validates the configuration; the model itself is loaded by [`load`].
    ///
    /// [`load`]: ModelManager::load
    pub fn new(
        config: ModelConfig,
        engine: Arc<dyn InferenceEngine>,
        reload_policy: ReloadPolicy,
    ) -> Result<Self, ServiceError> {
        let weight_format = config.weight_format.parse()?;
        let prompt_format = PromptFormat::by_id(&config.prompt_format)?;
        let model_name = config.model_name();

        Ok(Self {
            config,
            model_name,
            weight_format,
            prompt_format,
            engine,
            reload_policy,
            state: Arc::new(RwLock::new(None)),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn from_config(
        model_name_short: &str,
        source: Option<&ConfigSource>,
        engine: Arc<dyn InferenceEngine>,
        reload_policy: ReloadPolicy,
    ) -> Result<Self, ServiceError> {
        let config = registry::resolve(model_name_short, source)?;
        Self::new(config, engine, reload_policy)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_name_short(&self) -> &str {
        if self.config.short_name.is_empty() {
            &self.model_name
        } else {
            &self.config.short_name
        }
    }

    pub fn weight_format(&self) -> WeightFormat {
        self.weight_format
    }

    pub fn prompt_format(&self) -> &'static PromptFormat {
        self.prompt_format
    }

    pub fn format_prompt(&self, prompt: &str, system_prompt: Option<&str>) -> String {
        self.prompt_format.render(prompt, system_prompt)
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Loads the model unless it already is. Callers observe either the
    /// previous state or a fully loaded model, never anything in between.
    pub async fn load(&self) -> Result<(), ServiceError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.read().await.is_some() {
            return Ok(());
        }

        let loaded = self.load_state().await?;
        *self.state.write().await = Some(loaded);
        Ok(())
    }

    /// Drops the current model and loads it again from disk.
    pub async fn reload(&self) -> Result<(), ServiceError> {
        let _lifecycle = match self.reload_policy {
            ReloadPolicy::Reject => self
                .lifecycle
                .try_lock()
                .map_err(|_| ServiceError::ReloadInProgress)?,
            ReloadPolicy::Queue => self.lifecycle.lock().await,
        };
        let mut guard = self.exclusive().await?;

        info!(model = self.model_name_short(), "reloading model");
        *guard = None;
        let loaded = self.load_state().await?;
        *guard = Some(loaded);
        Ok(())
    }

    pub async fn unload(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let mut guard = self.state.write().await;
        if guard.take().is_some() {
            info!(model = self.model_name_short(), "model unloaded");
        }
    }

    /// Shared lease on the loaded model. Waits while a reload is swapping
    /// models and fails with [`ServiceError::ModelNotLoaded`] when there is
    /// nothing loaded.
    pub async fn lease(&self) -> Result<ModelLease, ServiceError> {
        let guard = self.state.clone().read_owned().await;
        let loaded = OwnedRwLockReadGuard::try_map(guard, |state| state.as_ref())
            .map_err(|_| ServiceError::ModelNotLoaded)?;
        Ok(ModelLease {
            loaded,
            prompt_format: self.prompt_format,
        })
    }

    /// Runs one generation on a blocking worker and returns the
    /// continuation text.
    pub async fn generate(
        &self,
        prompt: String,
        settings: SamplerSettings,
        max_new_tokens: Option<usize>,
    ) -> Result<String, ServiceError> {
        let lease = self.lease().await?;
        let max_new_tokens = max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        task::spawn_blocking(move || lease.generate(&prompt, &settings, max_new_tokens))
            .await
            .map_err(|err| ServiceError::Generation(format!("generation task failed: {err}")))?
    }

    pub async fn encode(&self, text: String) -> Result<Vec<u32>, ServiceError> {
        let lease = self.lease().await?;
        task::spawn_blocking(move || lease.encode(&text))
            .await
            .map_err(|err| ServiceError::Tokenizer(format!("tokenizer task failed: {err}")))?
    }

    async fn exclusive(&self) -> Result<OwnedRwLockWriteGuard<Option<LoadedState>>, ServiceError> {
        match self.reload_policy {
            ReloadPolicy::Reject => self.state.clone().try_write_owned().map_err(|_| {
                warn!(
                    model = self.model_name_short(),
                    "reload rejected while model is in use"
                );
                ServiceError::ReloadInProgress
            }),
            ReloadPolicy::Queue => Ok(self.state.clone().write_owned().await),
        }
    }

    async fn load_state(&self) -> Result<LoadedState, ServiceError> {
        let engine = self.engine.clone();
        let config = self.config.clone();
        let prompt_format = self.prompt_format;
        let started = Instant::now();
        info!(
            model = self.model_name_short(),
            path = %config.path.display(),
            format = %self.weight_format,
            "loading model"
        );

        let loaded = task::spawn_blocking(move || {
            let model = engine.load(&config)?;
            let stop_conditions = prompt_format.stop_conditions(model.tokenizer());
            Ok::<_, ServiceError>(LoadedState {
                model,
                stop_conditions,
            })
        })
        .await
        .map_err(|err| ServiceError::Generation(format!("model load task failed: {err}")))??;

        info!(
            model = self.model_name_short(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            stop_conditions = loaded.stop_conditions.len(),
            "model loaded"
        );
        Ok(loaded)
    }
}

/// Shared access to the loaded model, held for the duration of one call.
pub struct ModelLease {
    loaded: OwnedRwLockReadGuard<Option<LoadedState>, LoadedState>,
    prompt_format: &'static PromptFormat,
}

impl ModelLease {
    pub fn generate(
        &self,
        prompt: &str,
        settings: &SamplerSettings,
        max_new_tokens: usize,
    ) -> Result<String, ServiceError> {
        let job = GenerationJob {
            prompt,
            settings,
            max_new_tokens,
            stop_conditions: &self.loaded.stop_conditions,
            encode_options: self.prompt_format.encoding,
        };
        self.loaded.model.generate(&job)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        self.prompt_format
            .encode(self.loaded.model.tokenizer(), text)
    }

    pub fn stop_conditions(&self) -> &[StopCondition] {
        &self.loaded.stop_conditions
    }
}

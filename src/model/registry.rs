use std::{
    borrow::Cow,
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServiceError;

pub const REGISTRY_FILE_NAME: &str = "models.yaml";

fn default_config_fname() -> String {
    "config.json".to_string()
}

fn default_max_position_embeddings_kw() -> String {
    "max_position_embeddings".to_string()
}

/// One entry under `Models` as written in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub llm_path: PathBuf,
    pub weight_format: String,
    pub prompt_format: String,
    #[serde(default = "default_config_fname")]
    pub config_fname: String,
    #[serde(default = "default_max_position_embeddings_kw")]
    pub max_position_embeddings_kw: String,
    /// Skips the metadata lookup when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_embeddings: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(rename = "Models")]
    pub models: BTreeMap<String, ModelEntry>,
}

impl RegistryDocument {
    pub fn from_yaml(raw: &str) -> Result<Self, ServiceError> {
        serde_yaml::from_str(raw)
            .map_err(|e| ServiceError::InvalidConfig(format!("malformed model registry: {e}")))
    }

    pub fn from_path(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ServiceError::InvalidConfig(format!(
                "cannot read model registry {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn short_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }
}

/// Where the registry comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Already-parsed mapping. `llm_path`s are used as written.
    Mapping(RegistryDocument),
    /// Explicit registry file. `llm_path`s are used as written.
    File(PathBuf),
    /// Base directory holding `models.yaml`; `llm_path`s are joined onto it.
    ModelHome(PathBuf),
}

impl ConfigSource {
    /// Falls back to `$MODEL_HOME` when no explicit source is supplied.
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup("MODEL_HOME").filter(|home| !home.is_empty()) {
            Some(home) => Ok(ConfigSource::ModelHome(PathBuf::from(home))),
            None => Err(ServiceError::MissingConfiguration(
                "MODEL_HOME is not set. Either set MODEL_HOME or pass a config.".into(),
            )),
        }
    }

    fn load(&self) -> Result<(RegistryDocument, Option<&Path>), ServiceError> {
        match self {
            ConfigSource::Mapping(document) => Ok((document.clone(), None)),
            ConfigSource::File(path) => Ok((RegistryDocument::from_path(path)?, None)),
            ConfigSource::ModelHome(home) => Ok((
                RegistryDocument::from_path(&home.join(REGISTRY_FILE_NAME))?,
                Some(home.as_path()),
            )),
        }
    }
}

/// Fully resolved configuration of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    pub short_name: String,
    pub path: PathBuf,
    pub weight_format: String,
    pub prompt_format: String,
    pub config_fname: String,
    pub max_context_length: usize,
}

impl ModelConfig {
    /// Final path component of the model directory.
    pub fn model_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.short_name.clone())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(&self.config_fname)
    }
}

/// Resolves `short_name` against `source`, or against `$MODEL_HOME` when no
/// source is given.
pub fn resolve(short_name: &str, source: Option<&ConfigSource>) -> Result<ModelConfig, ServiceError> {
    resolve_with(short_name, source, |key| env::var(key).ok())
}

/// Like [`resolve`], reading `MODEL_HOME` through `lookup` instead of the
/// process environment.
pub fn resolve_with<F>(
    short_name: &str,
    source: Option<&ConfigSource>,
    lookup: F,
) -> Result<ModelConfig, ServiceError>
where
    F: Fn(&str) -> Option<String>,
{
    let source = source_or_lookup(source, lookup)?;
    let (document, base) = source.load()?;
    let Some(entry) = document.models.get(short_name) else {
        return Err(ServiceError::NotFound {
            name: short_name.to_string(),
            available: document.short_names(),
        });
    };
    resolve_entry(short_name, entry, base)
}

/// Resolves every entry of the registry, ordered by short name.
pub fn resolve_all(source: Option<&ConfigSource>) -> Result<Vec<ModelConfig>, ServiceError> {
    resolve_all_with(source, |key| env::var(key).ok())
}

pub fn resolve_all_with<F>(
    source: Option<&ConfigSource>,
    lookup: F,
) -> Result<Vec<ModelConfig>, ServiceError>
where
    F: Fn(&str) -> Option<String>,
{
    let source = source_or_lookup(source, lookup)?;
    let (document, base) = source.load()?;
    document
        .models
        .iter()
        .map(|(name, entry)| resolve_entry(name, entry, base))
        .collect()
}

fn source_or_lookup<F>(
    source: Option<&ConfigSource>,
    lookup: F,
) -> Result<Cow<'_, ConfigSource>, ServiceError>
where
    F: Fn(&str) -> Option<String>,
{
    match source {
        Some(source) => Ok(Cow::Borrowed(source)),
        None => ConfigSource::from_lookup(lookup).map(Cow::Owned),
    }
}

fn resolve_entry(
    short_name: &str,
    entry: &ModelEntry,
    base: Option<&Path>,
) -> Result<ModelConfig, ServiceError> {
    let path = match base {
        Some(base) => base.join(&entry.llm_path),
        None => entry.llm_path.clone(),
    };

    let max_context_length = match entry.max_position_embeddings {
        Some(0) => {
            return Err(ServiceError::InvalidConfig(format!(
                "{short_name}: max_position_embeddings must be a positive integer, got 0"
            )));
        }
        Some(value) => value,
        None => read_context_length(&path, &entry.config_fname, &entry.max_position_embeddings_kw)?,
    };
    debug!(model = short_name, max_context_length, "resolved model config");

    Ok(ModelConfig {
        short_name: short_name.to_string(),
        path,
        weight_format: entry.weight_format.clone(),
        prompt_format: entry.prompt_format.clone(),
        config_fname: entry.config_fname.clone(),
        max_context_length,
    })
}

fn read_context_length(llm_path: &Path, config_fname: &str, key: &str) -> Result<usize, ServiceError> {
    let path = llm_path.join(config_fname);
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if !path.is_file() || !is_json {
        return Err(ServiceError::InvalidConfig(format!(
            "Invalid llm_path: {} must contain a valid JSON file named {config_fname}.",
            llm_path.display()
        )));
    }

    let raw = fs::read_to_string(&path).map_err(|e| {
        ServiceError::InvalidConfig(format!(
            "Error reading config from {}: {e}",
            llm_path.display()
        ))
    })?;
    let metadata: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        ServiceError::InvalidConfig(format!(
            "Error reading config from {}: {e}",
            llm_path.display()
        ))
    })?;

    let value = metadata.get(key).ok_or_else(|| {
        ServiceError::InvalidConfig(format!(
            "Error reading config from {}: missing key '{key}'",
            llm_path.display()
        ))
    })?;

    match value.as_u64() {
        Some(n) if n > 0 => Ok(n as usize),
        _ => Err(ServiceError::InvalidConfig(format!(
            "Error reading config from {}: '{key}' must be a positive integer, got {value}",
            llm_path.display()
        ))),
    }
}

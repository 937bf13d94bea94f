use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use crate::{error::ServiceError, model::ConfigSource};

pub const DEFAULT_MAX_NEW_TOKENS: usize = 500;

/// How `/reload-model` behaves while generation leases are outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPolicy {
    /// Fail fast with 409 Conflict.
    #[default]
    Reject,
    /// Wait until in-flight calls release the model.
    Queue,
}

impl FromStr for ReloadPolicy {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "reject" => Ok(ReloadPolicy::Reject),
            "queue" | "wait" => Ok(ReloadPolicy::Queue),
            other => Err(ServiceError::InvalidConfig(format!(
                "unknown RELOAD_POLICY '{other}', expected 'reject' or 'queue'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_name_short: String,
    pub model_source: ConfigSource,
    pub max_new_tokens: usize,
    pub reload_policy: ReloadPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so callers can
    /// supply values without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let model_name_short = lookup("EXL2_MODEL")
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::MissingConfiguration(
                    "EXL2_MODEL is not set. Set it to the short name of the model to serve."
                        .into(),
                )
            })?;

        let model_source = match lookup("MODEL_CONFIG").filter(|p| !p.is_empty()) {
            Some(path) => ConfigSource::File(PathBuf::from(path)),
            None => match lookup("MODEL_HOME").filter(|p| !p.is_empty()) {
                Some(home) => ConfigSource::ModelHome(PathBuf::from(home)),
                None => {
                    return Err(ServiceError::MissingConfiguration(
                        "MODEL_HOME is not set. Either set MODEL_HOME or pass a config.".into(),
                    ));
                }
            },
        };

        let max_new_tokens = lookup("MAX_NEW_TOKENS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS);

        let reload_policy = match lookup("RELOAD_POLICY") {
            Some(raw) => raw.parse()?,
            None => ReloadPolicy::default(),
        };

        Ok(Self {
            listen_addr,
            model_name_short,
            model_source,
            max_new_tokens,
            reload_policy,
        })
    }
}

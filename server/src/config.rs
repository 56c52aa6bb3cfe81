use std::env;

use config::{Config, ConfigError, File};
use relay_core::chain::ChainConfig;
use relay_executors::{
    config::RelayConfig,
    webhook::{WebhookRetryConfig, WebhookTarget},
};
use relay_queue::queue::IdempotencyMode;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    pub signer: SignerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub relay: RelayDefaults,
}

/// Defaults for the runtime relay config; live overrides are read from Redis.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RelayDefaults {
    pub max_retries_per_tx: u32,
    pub min_elapsed_blocks_before_retry: u64,
}

impl Default for RelayDefaults {
    fn default() -> Self {
        let defaults = RelayConfig::default();
        Self {
            max_retries_per_tx: defaults.max_retries_per_tx,
            min_elapsed_blocks_before_retry: defaults.min_elapsed_blocks_before_retry,
        }
    }
}

impl From<RelayDefaults> for RelayConfig {
    fn from(defaults: RelayDefaults) -> Self {
        RelayConfig {
            max_retries_per_tx: defaults.max_retries_per_tx,
            min_elapsed_blocks_before_retry: defaults.min_elapsed_blocks_before_retry,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencySetting {
    Permanent,
    Active,
}

impl From<IdempotencySetting> for IdempotencyMode {
    fn from(setting: IdempotencySetting) -> Self {
        match setting {
            IdempotencySetting::Permanent => IdempotencyMode::Permanent,
            IdempotencySetting::Active => IdempotencyMode::Active,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub execution_namespace: Option<String>,
    pub polling_interval_ms: u64,
    pub lease_duration_seconds: u64,
    pub always_poll: bool,

    pub send_workers: usize,
    pub mine_workers: usize,
    pub webhook_workers: usize,

    pub send_max_attempts: u32,
    pub send_retry_delay_ms: u64,
    pub mine_max_attempts: u32,
    pub mine_poll_delay_ms: u64,

    /// Applies to the send queue; mine jobs always release their id when they finish.
    pub send_idempotency: IdempotencySetting,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            execution_namespace: None,
            polling_interval_ms: 100,
            lease_duration_seconds: 30,
            always_poll: true,
            send_workers: 50,
            mine_workers: 100,
            webhook_workers: 50,
            send_max_attempts: 10,
            send_retry_delay_ms: 5_000,
            mine_max_attempts: 100,
            mine_poll_delay_ms: 5_000,
            send_idempotency: IdempotencySetting::Permanent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub private_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub targets: Vec<WebhookTarget>,
    pub retry: WebhookRetryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub url: Option<String>,
}

/// Loads `configuration/server_base.yaml`, then `configuration/server_{APP_ENVIRONMENT}.yaml`,
/// then `APP__SECTION__KEY` environment overrides.
pub fn get_config() -> Result<EngineConfig, ConfigError> {
    let base_path = env::current_dir()
        .map_err(|e| ConfigError::Message(format!("Failed to determine the current directory: {e}")))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Message)?;

    let environment_filename = format!("server_{}.yaml", environment.as_str());

    Config::builder()
        .add_source(File::from(configuration_directory.join("server_base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        .add_source(config::Environment::with_prefix("app").separator("__"))
        .build()?
        .try_deserialize::<EngineConfig>()
}

/// The possible runtime environment for our application.
pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use either `local`, `development`, or `production`."
            )),
        }
    }
}

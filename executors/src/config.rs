use std::collections::HashMap;

use async_trait::async_trait;
use relay_core::error::EngineError;
use relay_queue::redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};

/// Retry policy, read fresh at every decision point so operators can change it live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub max_retries_per_tx: u32,
    #[serde(alias = "minEllapsedBlocksBeforeRetry")]
    pub min_elapsed_blocks_before_retry: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries_per_tx: 3,
            min_elapsed_blocks_before_retry: 12,
        }
    }
}

#[async_trait]
pub trait RelayConfigProvider: Send + Sync {
    async fn relay_config(&self) -> Result<RelayConfig, EngineError>;
}

/// Fixed configuration.
pub struct StaticRelayConfigProvider(pub RelayConfig);

#[async_trait]
impl RelayConfigProvider for StaticRelayConfigProvider {
    async fn relay_config(&self) -> Result<RelayConfig, EngineError> {
        Ok(self.0)
    }
}

/// Reads overrides from a Redis hash, falling back to `defaults` per field.
///
/// Fields: `maxRetriesPerTx`, `minEllapsedBlocksBeforeRetry`.
pub struct RedisRelayConfigProvider {
    redis: ConnectionManager,
    key: String,
    defaults: RelayConfig,
}

impl RedisRelayConfigProvider {
    pub fn new(redis: ConnectionManager, namespace: Option<&str>, defaults: RelayConfig) -> Self {
        let key = match namespace {
            Some(ns) => format!("{ns}:relay:config"),
            None => "relay:config".to_string(),
        };
        Self {
            redis,
            key,
            defaults,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Option<T> {
    let raw = fields.get(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(field = name, value = raw, "Ignoring unparseable relay config value");
            None
        }
    }
}

#[async_trait]
impl RelayConfigProvider for RedisRelayConfigProvider {
    async fn relay_config(&self) -> Result<RelayConfig, EngineError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(&self.key).await?;

        Ok(RelayConfig {
            max_retries_per_tx: parse_field(&fields, "maxRetriesPerTx")
                .unwrap_or(self.defaults.max_retries_per_tx),
            min_elapsed_blocks_before_retry: parse_field(&fields, "minEllapsedBlocksBeforeRetry")
                .unwrap_or(self.defaults.min_elapsed_blocks_before_retry),
        })
    }
}

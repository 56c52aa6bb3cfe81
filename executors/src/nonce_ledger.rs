use alloy::primitives::Address;
use async_trait::async_trait;
use relay_core::error::EngineError;
use relay_queue::redis::{self, AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NonceLedgerError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Wallet {address} on chain {chain_id} needs sync - no nonce counter found")]
    NeedsSync { chain_id: u64, address: Address },

    #[error("Nonce ledger error: {message}")]
    Internal { message: String },
}

impl From<NonceLedgerError> for EngineError {
    fn from(err: NonceLedgerError) -> Self {
        EngineError::InternalError {
            message: err.to_string(),
        }
    }
}

/// Point-in-time view of one wallet's ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceSnapshot {
    /// `None` until the wallet has been synced.
    pub next_nonce: Option<u64>,
    pub in_flight: Vec<u64>,
    pub recyclable: Vec<u64>,
}

/// Per (chain, wallet) nonce issuance shared by every worker process.
///
/// `allocate` is a critical section: concurrent callers for the same wallet never receive the
/// same nonce. An allocated nonce is in flight until it is removed, and it is only handed out
/// again after it has been recycled.
#[async_trait]
pub trait NonceLedger: Send + Sync {
    /// Pops the lowest recyclable nonce, or takes the next counter value, and marks it in flight.
    async fn allocate(&self, chain_id: u64, address: Address) -> Result<u64, NonceLedgerError>;

    async fn mark_in_flight(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<(), NonceLedgerError>;

    /// Returns whether the nonce was in flight.
    async fn remove_from_in_flight(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<bool, NonceLedgerError>;

    /// Makes the nonce available to `allocate` again. Recycling twice is a no-op, and nonces
    /// the counter has not reached yet are ignored.
    async fn recycle(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<(), NonceLedgerError>;

    /// Raises the counter to `onchain_next` if it is missing or lower. Never lowers it.
    /// Returns the counter after the call.
    async fn sync(
        &self,
        chain_id: u64,
        address: Address,
        onchain_next: u64,
    ) -> Result<u64, NonceLedgerError>;

    async fn snapshot(
        &self,
        chain_id: u64,
        address: Address,
    ) -> Result<NonceSnapshot, NonceLedgerError>;
}

pub struct RedisNonceLedger {
    redis: ConnectionManager,
    namespace: Option<String>,
}

impl RedisNonceLedger {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self { redis, namespace }
    }

    fn wallet_prefix(&self, chain_id: u64, address: Address) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:nonce:{chain_id}:{address}"),
            None => format!("nonce:{chain_id}:{address}"),
        }
    }

    fn next_nonce_key(&self, chain_id: u64, address: Address) -> String {
        format!("{}:next", self.wallet_prefix(chain_id, address))
    }

    fn in_flight_key(&self, chain_id: u64, address: Address) -> String {
        format!("{}:in_flight", self.wallet_prefix(chain_id, address))
    }

    fn recyclable_key(&self, chain_id: u64, address: Address) -> String {
        format!("{}:recyclable", self.wallet_prefix(chain_id, address))
    }
}

#[async_trait]
impl NonceLedger for RedisNonceLedger {
    async fn allocate(&self, chain_id: u64, address: Address) -> Result<u64, NonceLedgerError> {
        let script = redis::Script::new(
            r#"
            local next_key = KEYS[1]
            local in_flight_key = KEYS[2]
            local recyclable_key = KEYS[3]

            local next_nonce = redis.call('GET', next_key)
            if not next_nonce then
                return {-1, "needs_sync"}
            end

            local recycled = redis.call('ZPOPMIN', recyclable_key)
            if #recycled > 0 then
                redis.call('SADD', in_flight_key, recycled[1])
                return {0, recycled[1]}
            end

            local nonce = tonumber(next_nonce)
            redis.call('SET', next_key, nonce + 1)
            redis.call('SADD', in_flight_key, nonce)
            return {1, tostring(nonce)}
            "#,
        );

        let (code, value): (i64, String) = script
            .key(self.next_nonce_key(chain_id, address))
            .key(self.in_flight_key(chain_id, address))
            .key(self.recyclable_key(chain_id, address))
            .invoke_async(&mut self.redis.clone())
            .await?;

        if code < 0 {
            return Err(NonceLedgerError::NeedsSync { chain_id, address });
        }

        let nonce = value.parse::<u64>().map_err(|e| NonceLedgerError::Internal {
            message: format!("Unparseable nonce '{value}': {e}"),
        })?;

        tracing::debug!(
            chain_id,
            address = %address,
            nonce,
            recycled = code == 0,
            "Allocated nonce"
        );
        Ok(nonce)
    }

    async fn mark_in_flight(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<(), NonceLedgerError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(self.in_flight_key(chain_id, address), nonce)
            .await?;
        Ok(())
    }

    async fn remove_from_in_flight(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<bool, NonceLedgerError> {
        let mut conn = self.redis.clone();
        let removed: u32 = conn
            .srem(self.in_flight_key(chain_id, address), nonce)
            .await?;
        Ok(removed > 0)
    }

    async fn recycle(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<(), NonceLedgerError> {
        let script = redis::Script::new(
            r#"
            local next_key = KEYS[1]
            local recyclable_key = KEYS[2]
            local nonce = tonumber(ARGV[1])

            local next_nonce = redis.call('GET', next_key)
            if not next_nonce or nonce >= tonumber(next_nonce) then
                return 0
            end

            redis.call('ZADD', recyclable_key, nonce, tostring(nonce))
            return 1
            "#,
        );

        let recycled: i32 = script
            .key(self.next_nonce_key(chain_id, address))
            .key(self.recyclable_key(chain_id, address))
            .arg(nonce)
            .invoke_async(&mut self.redis.clone())
            .await?;

        if recycled == 0 {
            tracing::warn!(chain_id, address = %address, nonce, "Ignored recycle of unissued nonce");
        }
        Ok(())
    }

    async fn sync(
        &self,
        chain_id: u64,
        address: Address,
        onchain_next: u64,
    ) -> Result<u64, NonceLedgerError> {
        let script = redis::Script::new(
            r#"
            local next_key = KEYS[1]
            local recyclable_key = KEYS[2]
            local onchain_next = tonumber(ARGV[1])

            local current = redis.call('GET', next_key)
            if current and tonumber(current) >= onchain_next then
                return tonumber(current)
            end

            redis.call('SET', next_key, onchain_next)
            -- nonces below the chain's count are consumed and can never be reused
            redis.call('ZREMRANGEBYSCORE', recyclable_key, '-inf', '(' .. onchain_next)
            return onchain_next
            "#,
        );

        let next: u64 = script
            .key(self.next_nonce_key(chain_id, address))
            .key(self.recyclable_key(chain_id, address))
            .arg(onchain_next)
            .invoke_async(&mut self.redis.clone())
            .await?;

        tracing::info!(chain_id, address = %address, onchain_next, next_nonce = next, "Synced nonce counter");
        Ok(next)
    }

    async fn snapshot(
        &self,
        chain_id: u64,
        address: Address,
    ) -> Result<NonceSnapshot, NonceLedgerError> {
        let mut conn = self.redis.clone();
        let next_nonce: Option<u64> = conn.get(self.next_nonce_key(chain_id, address)).await?;
        let mut in_flight: Vec<u64> = conn.smembers(self.in_flight_key(chain_id, address)).await?;
        let recyclable: Vec<u64> = conn
            .zrange(self.recyclable_key(chain_id, address), 0, -1)
            .await?;
        in_flight.sort_unstable();

        Ok(NonceSnapshot {
            next_nonce,
            in_flight,
            recyclable,
        })
    }
}

use async_trait::async_trait;
use relay_core::{
    error::EngineError,
    transaction::{TransactionRecord, TransactionStatus},
};
use relay_queue::redis::{self, AsyncCommands, aio::ConnectionManager};
use thiserror::Error;

const MAX_UPDATE_ATTEMPTS: u32 = 3;

const ALL_STATUSES: [TransactionStatus; 5] = [
    TransactionStatus::Queued,
    TransactionStatus::Sent,
    TransactionStatus::Mined,
    TransactionStatus::Errored,
    TransactionStatus::Cancelled,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Transaction {queue_id} not found")]
    NotFound { queue_id: String },

    #[error("Transaction {queue_id} already exists")]
    AlreadyExists { queue_id: String },

    #[error("Transaction {queue_id} was modified concurrently (expected version {expected})")]
    VersionConflict { queue_id: String, expected: u64 },

    #[error("Transaction {queue_id} cannot move from {from} to {to}")]
    InvalidTransition {
        queue_id: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::InternalError {
            message: err.to_string(),
        }
    }
}

/// Durable record of every transaction, keyed by queue id.
///
/// Writes are optimistic: `update` succeeds only if the stored version still equals
/// `record.version` and the stored status may legally move to `record.status`.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), StoreError>;

    async fn get(&self, queue_id: &str) -> Result<Option<TransactionRecord>, StoreError>;

    /// Returns the record as stored, with its version bumped.
    async fn update(&self, record: TransactionRecord) -> Result<TransactionRecord, StoreError>;
}

/// Statuses from which a write of `to` is legal.
pub(crate) fn allowed_previous(to: TransactionStatus) -> Vec<TransactionStatus> {
    ALL_STATUSES
        .into_iter()
        .filter(|from| from.can_transition_to(to))
        .collect()
}

/// Applies `apply` to `record` and writes it back, reloading and reapplying when another
/// writer got there first.
///
/// `apply` decides eligibility: returning `false` leaves the store untouched and yields
/// `Ok(None)`. It may run more than once, always against the freshest record.
pub async fn update_with<F>(
    store: &dyn TransactionStore,
    mut record: TransactionRecord,
    mut apply: F,
) -> Result<Option<TransactionRecord>, StoreError>
where
    F: FnMut(&mut TransactionRecord) -> bool + Send,
{
    let queue_id = record.queue_id.clone();
    let mut attempt = 1;

    loop {
        let mut candidate = record.clone();
        if !apply(&mut candidate) {
            return Ok(None);
        }

        match store.update(candidate).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(StoreError::VersionConflict { .. } | StoreError::InvalidTransition { .. })
                if attempt < MAX_UPDATE_ATTEMPTS =>
            {
                attempt += 1;
                tracing::debug!(queue_id, attempt, "Record changed underneath us, reloading");
                record = store
                    .get(&queue_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound {
                        queue_id: queue_id.clone(),
                    })?;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct RedisTransactionStore {
    redis: ConnectionManager,
    namespace: Option<String>,
}

impl RedisTransactionStore {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self { redis, namespace }
    }

    fn record_key(&self, queue_id: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relay:tx:{queue_id}"),
            None => format!("relay:tx:{queue_id}"),
        }
    }
}

#[async_trait]
impl TransactionStore for RedisTransactionStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let script = redis::Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return 0
            end
            redis.call('HSET', KEYS[1], 'version', ARGV[1], 'status', ARGV[2], 'data', ARGV[3])
            return 1
            "#,
        );

        let inserted: i32 = script
            .key(self.record_key(&record.queue_id))
            .arg(record.version)
            .arg(record.status.as_str())
            .arg(serde_json::to_string(record)?)
            .invoke_async(&mut self.redis.clone())
            .await?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                queue_id: record.queue_id.clone(),
            });
        }
        Ok(())
    }

    async fn get(&self, queue_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(self.record_key(queue_id), "data").await?;
        data.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn update(&self, mut record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let script = redis::Script::new(
            r#"
            local key = KEYS[1]
            local expected_version = ARGV[1]
            local new_status = ARGV[2]
            local data = ARGV[3]

            local current = redis.call('HMGET', key, 'version', 'status')
            if not current[1] then
                return {-1, ""}
            end
            if current[1] ~= expected_version then
                return {-2, current[2]}
            end

            local allowed = false
            for i = 4, #ARGV do
                if ARGV[i] == current[2] then
                    allowed = true
                    break
                end
            end
            if not allowed then
                return {-3, current[2]}
            end

            redis.call('HSET', key, 'version', tonumber(expected_version) + 1, 'status', new_status, 'data', data)
            return {1, new_status}
            "#,
        );

        let expected = record.version;
        record.version += 1;

        let mut invocation = script.key(self.record_key(&record.queue_id));
        invocation
            .arg(expected)
            .arg(record.status.as_str())
            .arg(serde_json::to_string(&record)?);
        for status in allowed_previous(record.status) {
            invocation.arg(status.as_str());
        }

        let (code, stored_status): (i64, String) =
            invocation.invoke_async(&mut self.redis.clone()).await?;

        match code {
            1 => Ok(record),
            -1 => Err(StoreError::NotFound {
                queue_id: record.queue_id,
            }),
            -2 => Err(StoreError::VersionConflict {
                queue_id: record.queue_id,
                expected,
            }),
            _ => {
                let from = serde_json::from_value(serde_json::Value::String(stored_status))?;
                Err(StoreError::InvalidTransition {
                    queue_id: record.queue_id,
                    from,
                    to: record.status,
                })
            }
        }
    }
}

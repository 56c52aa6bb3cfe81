use std::{collections::HashMap, marker::PhantomData, sync::Arc, time::Duration};

use redis::{AsyncCommands, Client, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    DurableExecution, Queue,
    error::QueueError,
    job::{Job, JobOptions, JobStatus, PushOutcome, PushableJob, RequeuePosition},
    now_millis,
};

/// Controls how long a job id stays reserved in the dedupe set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdempotencyMode {
    /// Ids stay reserved until the finished job is pruned from the success/failed lists.
    Permanent,
    /// Ids are released as soon as the job succeeds or fails.
    Active,
}

#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub max_success: usize,
    pub max_failed: usize,
    pub lease_duration: Duration,
    pub local_concurrency: usize,
    pub polling_interval: Duration,

    /// Poll even when no permits are free. Polling is what promotes delayed jobs and
    /// reclaims expired leases, so single-node deployments should keep this on.
    pub always_poll: bool,

    pub idempotency_mode: IdempotencyMode,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_success: 1000,
            max_failed: 10000,
            local_concurrency: 100,
            polling_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(30),
            always_poll: false,
            idempotency_mode: IdempotencyMode::Permanent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// Removed from pending/delayed. The fail hook runs on the next worker poll.
    CancelledImmediately,
    /// The job is running; it is failed once the current attempt finishes unsuccessfully.
    CancellationPending,
    NotFound,
}

/// Producer side of a queue: everything that does not need the job handler.
pub struct QueueHandle<T> {
    pub redis: ConnectionManager,
    name: String,
    _data: PhantomData<fn() -> T>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            redis: self.redis.clone(),
            name: self.name.clone(),
            _data: PhantomData,
        }
    }
}

impl<T> QueueHandle<T> {
    pub fn new(redis: ConnectionManager, name: impl Into<String>) -> Self {
        Self {
            redis,
            name: name.into(),
            _data: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_list_name(&self) -> String {
        format!("relayq:{}:pending", self.name)
    }

    pub fn active_hash_name(&self) -> String {
        format!("relayq:{}:active", self.name)
    }

    pub fn delayed_zset_name(&self) -> String {
        format!("relayq:{}:delayed", self.name)
    }

    pub fn success_list_name(&self) -> String {
        format!("relayq:{}:success", self.name)
    }

    pub fn failed_list_name(&self) -> String {
        format!("relayq:{}:failed", self.name)
    }

    pub fn job_data_hash_name(&self) -> String {
        format!("relayq:{}:jobs:data", self.name)
    }

    pub fn job_meta_hash_name(&self, job_id: &str) -> String {
        format!("relayq:{}:job:{}:meta", self.name, job_id)
    }

    pub fn job_errors_list_name(&self, job_id: &str) -> String {
        format!("relayq:{}:job:{}:errors", self.name, job_id)
    }

    pub fn job_result_hash_name(&self) -> String {
        format!("relayq:{}:jobs:result", self.name)
    }

    pub fn dedupe_set_name(&self) -> String {
        format!("relayq:{}:dedup", self.name)
    }

    pub fn pending_cancellation_set_name(&self) -> String {
        format!("relayq:{}:pending_cancellations", self.name)
    }

    pub fn lease_key_name(&self, job_id: &str, lease_token: &str) -> String {
        format!("relayq:{}:job:{}:lease:{}", self.name, job_id, lease_token)
    }

    pub async fn count(&self, status: JobStatus) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();

        let count: usize = match status {
            JobStatus::Pending => conn.llen(self.pending_list_name()).await?,
            JobStatus::Active => conn.hlen(self.active_hash_name()).await?,
            JobStatus::Delayed => conn.zcard(self.delayed_zset_name()).await?,
            JobStatus::Success => conn.llen(self.success_list_name()).await?,
            JobStatus::Failed => conn.llen(self.failed_list_name()).await?,
        };

        Ok(count)
    }

    /// Removes a job that has not started yet, or flags a running one for cancellation.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelResult, QueueError> {
        let script = redis::Script::new(
            r#"
            local job_id = ARGV[1]

            local pending_list = KEYS[1]
            local delayed_zset = KEYS[2]
            local active_hash = KEYS[3]
            local pending_cancellation_set = KEYS[4]

            if redis.call('LREM', pending_list, 0, job_id) > 0 then
                redis.call('SADD', pending_cancellation_set, job_id)
                return "cancelled_immediately"
            end

            if redis.call('ZREM', delayed_zset, job_id) > 0 then
                redis.call('SADD', pending_cancellation_set, job_id)
                return "cancelled_immediately"
            end

            if redis.call('HEXISTS', active_hash, job_id) == 1 then
                redis.call('SADD', pending_cancellation_set, job_id)
                return "cancellation_pending"
            end

            return "not_found"
            "#,
        );

        let result: String = script
            .key(self.pending_list_name())
            .key(self.delayed_zset_name())
            .key(self.active_hash_name())
            .key(self.pending_cancellation_set_name())
            .arg(job_id)
            .invoke_async(&mut self.redis.clone())
            .await?;

        match result.as_str() {
            "cancelled_immediately" => Ok(CancelResult::CancelledImmediately),
            "cancellation_pending" => Ok(CancelResult::CancellationPending),
            "not_found" => Ok(CancelResult::NotFound),
            other => Err(QueueError::Runtime {
                message: format!("Unexpected cancel result: {other}"),
            }),
        }
    }

    pub async fn remove_from_dedupe_set(&self, job_id: &str) -> Result<(), QueueError> {
        self.redis
            .clone()
            .srem::<_, _, ()>(self.dedupe_set_name(), job_id)
            .await?;
        Ok(())
    }
}

impl<T> QueueHandle<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn job(&self, data: T) -> PushableJob<T> {
        PushableJob {
            options: JobOptions::new(data),
            queue: self.clone(),
        }
    }

    pub async fn push(&self, job_options: JobOptions<T>) -> Result<PushOutcome, QueueError> {
        let script = redis::Script::new(
            r#"
            local job_id = ARGV[1]
            local job_data = ARGV[2]
            local now = tonumber(ARGV[3])
            local delay = tonumber(ARGV[4])
            local reentry_position = ARGV[5]

            local delayed_zset_name = KEYS[1]
            local pending_list_name = KEYS[2]
            local job_data_hash_name = KEYS[3]
            local job_meta_hash_name = KEYS[4]
            local dedupe_set_name = KEYS[5]

            if redis.call('SISMEMBER', dedupe_set_name, job_id) == 1 then
                return 0
            end

            redis.call('HSET', job_data_hash_name, job_id, job_data)
            redis.call('HSET', job_meta_hash_name, 'created_at', now, 'attempts', 0)
            redis.call('SADD', dedupe_set_name, job_id)

            if delay > 0 then
                redis.call('HSET', job_meta_hash_name, 'reentry_position', reentry_position)
                redis.call('ZADD', delayed_zset_name, now + delay, job_id)
            else
                redis.call('RPUSH', pending_list_name, job_id)
            end

            return 1
            "#,
        );

        let job_data = serde_json::to_string(&job_options.data)?;
        let (delay_ms, position) = job_options
            .delay
            .map(|d| (d.delay.as_millis() as u64, d.position))
            .unwrap_or((0, RequeuePosition::Last));

        let queued: i32 = script
            .key(self.delayed_zset_name())
            .key(self.pending_list_name())
            .key(self.job_data_hash_name())
            .key(self.job_meta_hash_name(&job_options.id))
            .key(self.dedupe_set_name())
            .arg(&job_options.id)
            .arg(job_data)
            .arg(now_millis())
            .arg(delay_ms)
            .arg(position.to_string())
            .invoke_async(&mut self.redis.clone())
            .await?;

        if queued == 1 {
            tracing::debug!(queue = self.name(), job_id = job_options.id, delay_ms, "Job queued");
            Ok(PushOutcome::Queued)
        } else {
            tracing::debug!(queue = self.name(), job_id = job_options.id, "Duplicate job id, skipped");
            Ok(PushOutcome::Duplicate)
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job<T>>, QueueError> {
        let mut conn = self.redis.clone();
        let data_json: Option<String> = conn.hget(self.job_data_hash_name(), job_id).await?;

        let Some(data_json) = data_json else {
            return Ok(None);
        };

        let data: T = serde_json::from_str(&data_json)?;
        let meta: HashMap<String, String> = conn.hgetall(self.job_meta_hash_name(job_id)).await?;
        let field = |name: &str| meta.get(name).and_then(|s| s.parse::<u64>().ok());

        Ok(Some(Job {
            id: job_id.to_string(),
            data,
            attempts: field("attempts").unwrap_or(0) as u32,
            created_at: field("created_at").unwrap_or(0),
            processed_at: field("processed_at"),
            finished_at: field("finished_at"),
        }))
    }
}

// Typestate markers for the builder
pub struct NoRedis;
pub struct HasRedis;
pub struct NoName;
pub struct HasName;
pub struct NoHandler;
pub struct HasHandler;

enum RedisSource {
    Url(String),
    Client(Client),
    ConnectionManager(ConnectionManager),
}

pub struct QueueBuilder<H, R, N, Hn>
where
    H: DurableExecution,
{
    redis_source: Option<RedisSource>,
    name: Option<String>,
    options: Option<QueueOptions>,
    handler: Option<H>,
    _phantom: PhantomData<(R, N, Hn)>,
}

impl<H: DurableExecution> Default for QueueBuilder<H, NoRedis, NoName, NoHandler> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: DurableExecution> QueueBuilder<H, NoRedis, NoName, NoHandler> {
    pub fn new() -> Self {
        Self {
            redis_source: None,
            name: None,
            options: None,
            handler: None,
            _phantom: PhantomData,
        }
    }
}

impl<H: DurableExecution, R, N, Hn> QueueBuilder<H, R, N, Hn> {
    fn retype<R2, N2, Hn2>(self) -> QueueBuilder<H, R2, N2, Hn2> {
        QueueBuilder {
            redis_source: self.redis_source,
            name: self.name,
            options: self.options,
            handler: self.handler,
            _phantom: PhantomData,
        }
    }

    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl<H: DurableExecution, N, Hn> QueueBuilder<H, NoRedis, N, Hn> {
    pub fn redis_url<S: Into<String>>(mut self, url: S) -> QueueBuilder<H, HasRedis, N, Hn> {
        self.redis_source = Some(RedisSource::Url(url.into()));
        self.retype()
    }

    pub fn redis_client(mut self, client: Client) -> QueueBuilder<H, HasRedis, N, Hn> {
        self.redis_source = Some(RedisSource::Client(client));
        self.retype()
    }

    pub fn redis_connection_manager(
        mut self,
        manager: ConnectionManager,
    ) -> QueueBuilder<H, HasRedis, N, Hn> {
        self.redis_source = Some(RedisSource::ConnectionManager(manager));
        self.retype()
    }
}

impl<H: DurableExecution, R, Hn> QueueBuilder<H, R, NoName, Hn> {
    pub fn name<S: Into<String>>(mut self, name: S) -> QueueBuilder<H, R, HasName, Hn> {
        self.name = Some(name.into());
        self.retype()
    }
}

impl<H: DurableExecution, R, N> QueueBuilder<H, R, N, NoHandler> {
    pub fn handler(mut self, handler: H) -> QueueBuilder<H, R, N, HasHandler> {
        self.handler = Some(handler);
        self.retype()
    }
}

impl<H: DurableExecution> QueueBuilder<H, HasRedis, HasName, HasHandler> {
    pub async fn build(self) -> Result<Queue<H>, QueueError> {
        let missing = |field: &str| QueueError::Runtime {
            message: format!("queue builder is missing {field}"),
        };
        let redis_source = self.redis_source.ok_or_else(|| missing("redis"))?;
        let name = self.name.ok_or_else(|| missing("name"))?;
        let handler = self.handler.ok_or_else(|| missing("handler"))?;

        let redis = match redis_source {
            RedisSource::Url(url) => Client::open(url)?.get_connection_manager().await?,
            RedisSource::Client(client) => client.get_connection_manager().await?,
            RedisSource::ConnectionManager(manager) => manager,
        };

        Ok(Queue {
            handle: QueueHandle::new(redis, name),
            options: self.options.unwrap_or_default(),
            handler: Arc::new(handler),
        })
    }
}

impl<H: DurableExecution> Queue<H> {
    pub fn builder() -> QueueBuilder<H, NoRedis, NoName, NoHandler> {
        QueueBuilder::new()
    }
}

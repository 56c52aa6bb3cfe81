pub mod error;
pub mod hooks;
pub mod job;
pub mod queue;
pub mod shutdown;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use error::QueueError;
use hooks::TransactionContext;
use job::{BorrowedJob, Job, JobError, JobErrorRecord, JobErrorType, JobResult, RequeueOptions, RequeuePosition};
use queue::{IdempotencyMode, QueueHandle, QueueOptions};
use redis::{AsyncCommands, Pipeline, RedisResult};
use serde::{Serialize, de::DeserializeOwned};
use shutdown::WorkerHandle;
use tokio::sync::Semaphore;
use tracing::Instrument;

pub use redis;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Error types produced when a job is cancelled from outside.
pub trait UserCancellable {
    fn user_cancelled() -> Self;
}

pub struct SuccessHookData<'a, O> {
    pub result: &'a O,
}

pub struct NackHookData<'a, E> {
    pub error: &'a E,
    pub delay: Option<Duration>,
    pub position: RequeuePosition,
}

pub struct FailHookData<'a, E> {
    pub error: &'a E,
}

pub struct QueueInternalErrorHookData<'a> {
    pub error: &'a QueueError,
}

pub trait DurableExecution: Sized + Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + Sync;
    type ErrorData: Serialize + DeserializeOwned + From<QueueError> + UserCancellable + Send + Sync;
    type JobData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> impl Future<Output = JobResult<Self::Output, Self::ErrorData>> + Send;

    fn on_success(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: SuccessHookData<'_, Self::Output>,
        _tx: &mut TransactionContext<'_>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn on_nack(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: NackHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn on_fail(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: FailHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    /// Called when the queue itself cannot hand the job to `process`, typically because the
    /// stored data no longer deserializes. Runs before the job is moved to the failed list.
    fn on_queue_error(
        &self,
        _job: &Job<Option<Self::JobData>>,
        _d: QueueInternalErrorHookData<'_>,
        _tx: &mut TransactionContext<'_>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

pub struct Queue<H>
where
    H: DurableExecution,
{
    handle: QueueHandle<H::JobData>,
    handler: Arc<H>,
    options: QueueOptions,
}

type PoppedJob = (String, String, String, String, String, String);

impl<H: DurableExecution> Queue<H> {
    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Producer handle that can be shared with other stages without the handler.
    pub fn handle(&self) -> &QueueHandle<H::JobData> {
        &self.handle
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn work(self: &Arc<Self>) -> WorkerHandle<H> {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let semaphore = Arc::new(Semaphore::new(self.options.local_concurrency));
        let queue = self.clone();

        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(queue.options.polling_interval);
            tracing::info!(queue = queue.name(), "Worker started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!(queue = queue.name(), "Shutdown signal received");
                        break;
                    }

                    _ = interval.tick() => {
                        let available_permits = semaphore.available_permits();
                        if available_permits == 0 && !queue.options.always_poll {
                            tracing::trace!("No permits available, waiting...");
                            continue;
                        }

                        let jobs = match queue.pop_batch_jobs(available_permits).await {
                            Ok(jobs) => jobs,
                            Err(e) => {
                                tracing::error!(queue = queue.name(), error = ?e, "Failed to pop batch jobs");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                continue;
                            }
                        };

                        for job in jobs {
                            let permit = match semaphore.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(e) => {
                                    tracing::error!(error = ?e, "Worker semaphore closed");
                                    break;
                                }
                            };
                            let queue = queue.clone();
                            let job_id = job.id().to_string();
                            let queue_name = queue.name().to_string();

                            tokio::spawn(
                                async move {
                                    let result = queue.handler.process(&job).await;
                                    if let Err(e) = queue.complete_job(&job, result).await {
                                        tracing::error!(job_id = job.id(), error = ?e, "Failed to complete job");
                                    }
                                    drop(permit);
                                }
                                .instrument(tracing::info_span!("relay_queue_worker", job_id, queue_name)),
                            );
                        }
                    }
                }
            }

            tracing::info!(queue = queue.name(), "Waiting for active jobs to complete");
            let concurrency = queue.options.local_concurrency as u32;
            let _permits = semaphore
                .acquire_many(concurrency)
                .await
                .map_err(|e| QueueError::Runtime {
                    message: format!("Failed to acquire permits during shutdown: {e}"),
                })?;

            tracing::info!(queue = queue.name(), "Worker shutdown complete");
            Ok(())
        });

        WorkerHandle {
            join_handle,
            shutdown_tx,
            queue: self.clone(),
        }
    }

    /// Reclaims expired leases, settles cancellations, promotes due delayed jobs, then leases
    /// up to `batch_size` pending jobs.
    async fn pop_batch_jobs(
        self: &Arc<Self>,
        batch_size: usize,
    ) -> RedisResult<Vec<BorrowedJob<H::JobData>>> {
        let script = redis::Script::new(
            r#"
            local now = tonumber(ARGV[1])
            local batch_size = tonumber(ARGV[2])
            local lease_ms = tonumber(ARGV[3])

            local queue_id = KEYS[1]
            local delayed_zset_name = KEYS[2]
            local pending_list_name = KEYS[3]
            local active_hash_name = KEYS[4]
            local job_data_hash_name = KEYS[5]
            local pending_cancellation_set = KEYS[6]
            local failed_list_name = KEYS[7]
            local success_list_name = KEYS[8]

            local function meta_key(job_id)
                return 'relayq:' .. queue_id .. ':job:' .. job_id .. ':meta'
            end

            local timed_out_jobs = {}
            local cancelled_jobs = {}

            -- 1. expired leases go back to the front of pending
            local active_jobs = redis.call('HGETALL', active_hash_name)
            for i = 1, #active_jobs, 2 do
                local job_id = active_jobs[i]
                local job_meta = meta_key(job_id)
                local lease_token = redis.call('HGET', job_meta, 'lease_token')
                local expired = true
                if lease_token then
                    local lease_key = 'relayq:' .. queue_id .. ':job:' .. job_id .. ':lease:' .. lease_token
                    expired = redis.call('EXISTS', lease_key) == 0
                end
                if expired then
                    redis.call('HDEL', job_meta, 'lease_token')
                    redis.call('HDEL', active_hash_name, job_id)
                    redis.call('LPUSH', pending_list_name, job_id)
                    table.insert(timed_out_jobs, job_id)
                end
            end

            -- 2. cancellations for jobs that are not running
            local cancel_requests = redis.call('SMEMBERS', pending_cancellation_set)
            for _, job_id in ipairs(cancel_requests) do
                if redis.call('HEXISTS', active_hash_name, job_id) == 0 then
                    local finished = redis.call('LPOS', success_list_name, job_id)
                        or redis.call('LPOS', failed_list_name, job_id)
                    if not finished then
                        redis.call('LREM', pending_list_name, 0, job_id)
                        redis.call('ZREM', delayed_zset_name, job_id)
                        redis.call('LPUSH', failed_list_name, job_id)
                        redis.call('HSET', meta_key(job_id), 'finished_at', now)
                        table.insert(cancelled_jobs, job_id)
                    end
                    redis.call('SREM', pending_cancellation_set, job_id)
                end
            end

            -- 3. due delayed jobs
            local delayed_jobs = redis.call('ZRANGEBYSCORE', delayed_zset_name, 0, now)
            for _, job_id in ipairs(delayed_jobs) do
                local job_meta = meta_key(job_id)
                local reentry_position = redis.call('HGET', job_meta, 'reentry_position') or 'last'
                redis.call('ZREM', delayed_zset_name, job_id)
                redis.call('HDEL', job_meta, 'reentry_position')
                if reentry_position == 'first' then
                    redis.call('LPUSH', pending_list_name, job_id)
                else
                    redis.call('RPUSH', pending_list_name, job_id)
                end
            end

            -- 4. lease pending jobs
            local result_jobs = {}
            for i = 1, batch_size do
                local job_id = redis.call('LPOP', pending_list_name)
                if not job_id then
                    break
                end
                local job_data = redis.call('HGET', job_data_hash_name, job_id)
                if job_data then
                    local job_meta = meta_key(job_id)
                    redis.call('HSET', job_meta, 'processed_at', now)
                    local created_at = redis.call('HGET', job_meta, 'created_at') or now
                    local attempts = redis.call('HINCRBY', job_meta, 'attempts', 1)
                    local lease_token = now .. '_' .. job_id .. '_' .. attempts
                    local lease_key = 'relayq:' .. queue_id .. ':job:' .. job_id .. ':lease:' .. lease_token
                    redis.call('SET', lease_key, '1', 'PX', lease_ms)
                    redis.call('HSET', job_meta, 'lease_token', lease_token)
                    redis.call('HSET', active_hash_name, job_id, attempts)
                    table.insert(result_jobs, {job_id, job_data, tostring(attempts), tostring(created_at), tostring(now), lease_token})
                end
            end

            return {result_jobs, cancelled_jobs, timed_out_jobs}
            "#,
        );

        let now = now_millis();
        let (job_results, cancelled_jobs, timed_out_jobs): (Vec<PoppedJob>, Vec<String>, Vec<String>) =
            script
                .key(self.name())
                .key(self.handle.delayed_zset_name())
                .key(self.handle.pending_list_name())
                .key(self.handle.active_hash_name())
                .key(self.handle.job_data_hash_name())
                .key(self.handle.pending_cancellation_set_name())
                .key(self.handle.failed_list_name())
                .key(self.handle.success_list_name())
                .arg(now)
                .arg(batch_size)
                .arg(self.options.lease_duration.as_millis() as u64)
                .invoke_async(&mut self.handle.redis.clone())
                .await?;

        for job_id in &timed_out_jobs {
            tracing::warn!(job_id = job_id, "Job lease expired, moved back to pending");
        }

        let mut jobs = Vec::with_capacity(job_results.len());
        for (job_id, data_json, attempts, created_at, processed_at, lease_token) in job_results {
            let attempts: u32 = attempts.parse().unwrap_or(1);
            let created_at: u64 = created_at.parse().unwrap_or(now);
            let processed_at: u64 = processed_at.parse().unwrap_or(now);

            match serde_json::from_str::<H::JobData>(&data_json) {
                Ok(data) => jobs.push(BorrowedJob::new(
                    Job {
                        id: job_id,
                        data,
                        attempts,
                        created_at,
                        processed_at: Some(processed_at),
                        finished_at: None,
                    },
                    lease_token,
                )),
                Err(e) => {
                    tracing::error!(job_id = job_id, error = ?e, "Failed to deserialize job data, failing job");
                    let queue = self.clone();
                    let job = Job {
                        id: job_id,
                        data: None,
                        attempts,
                        created_at,
                        processed_at: Some(processed_at),
                        finished_at: Some(now),
                    };
                    tokio::spawn(async move {
                        let error = QueueError::from(e);
                        if let Err(e) = queue.complete_job_queue_error(&job, &lease_token, error).await {
                            tracing::error!(job_id = job.id, error = ?e, "Failed to fail undecodable job");
                        }
                    });
                }
            }
        }

        for job_id in cancelled_jobs {
            let queue = self.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.process_cancelled_job(&job_id).await {
                    tracing::error!(job_id = job_id, error = ?e, "Failed to process cancelled job");
                }
            });
        }

        Ok(jobs)
    }

    async fn process_cancelled_job(&self, job_id: &str) -> Result<(), QueueError> {
        let Some(job) = self.handle.get_job(job_id).await? else {
            tracing::warn!(job_id = job_id, "Cancelled job not found when running hooks");
            return Ok(());
        };

        let error = H::ErrorData::user_cancelled();
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        let mut tx = TransactionContext::new(&mut pipeline, self.name().to_string());

        let borrowed = BorrowedJob::new(job, "cancelled".to_string());
        self.handler
            .on_fail(&borrowed, FailHookData { error: &error }, &mut tx)
            .await;

        if self.options.idempotency_mode == IdempotencyMode::Active {
            pipeline.srem(self.handle.dedupe_set_name(), job_id);
        }
        pipeline.query_async::<()>(&mut self.handle.redis.clone()).await?;

        tracing::info!(job_id = job_id, "Job cancelled");
        Ok(())
    }

    fn add_success_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        result: &H::Output,
        pipeline: &mut Pipeline,
    ) -> Result<(), QueueError> {
        let id = job.id();
        let meta = self.handle.job_meta_hash_name(id);

        pipeline
            .del(self.handle.lease_key_name(id, &job.lease_token))
            .hdel(self.handle.active_hash_name(), id)
            .lpush(self.handle.success_list_name(), id)
            .hset(&meta, "finished_at", now_millis())
            .hdel(&meta, "lease_token")
            .hset(
                self.handle.job_result_hash_name(),
                id,
                serde_json::to_string(result)?,
            );

        if self.options.idempotency_mode == IdempotencyMode::Active {
            pipeline.srem(self.handle.dedupe_set_name(), id);
        }

        Ok(())
    }

    fn add_nack_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        error: &H::ErrorData,
        delay: Option<Duration>,
        position: RequeuePosition,
        pipeline: &mut Pipeline,
    ) -> Result<(), QueueError> {
        let id = job.id();
        let meta = self.handle.job_meta_hash_name(id);
        let now = now_millis();

        pipeline
            .del(self.handle.lease_key_name(id, &job.lease_token))
            .hdel(self.handle.active_hash_name(), id)
            .hdel(&meta, "lease_token");

        let record = JobErrorRecord {
            error,
            attempt: job.job.attempts,
            details: JobErrorType::Nack(RequeueOptions { delay, position }),
            created_at: now,
        };
        pipeline.lpush(
            self.handle.job_errors_list_name(id),
            serde_json::to_string(&record)?,
        );

        match (delay, position) {
            (Some(delay), position) => {
                pipeline
                    .hset(&meta, "reentry_position", position.to_string())
                    .zadd(
                        self.handle.delayed_zset_name(),
                        id,
                        now + delay.as_millis() as u64,
                    );
            }
            (None, RequeuePosition::First) => {
                pipeline.lpush(self.handle.pending_list_name(), id);
            }
            (None, RequeuePosition::Last) => {
                pipeline.rpush(self.handle.pending_list_name(), id);
            }
        }

        Ok(())
    }

    fn add_fail_operations(
        &self,
        job_id: &str,
        attempt: u32,
        lease_token: &str,
        error: &H::ErrorData,
        pipeline: &mut Pipeline,
    ) -> Result<(), QueueError> {
        let meta = self.handle.job_meta_hash_name(job_id);
        let now = now_millis();

        pipeline
            .del(self.handle.lease_key_name(job_id, lease_token))
            .hdel(self.handle.active_hash_name(), job_id)
            .lpush(self.handle.failed_list_name(), job_id)
            .hset(&meta, "finished_at", now)
            .hdel(&meta, "lease_token");

        let record = JobErrorRecord {
            error,
            attempt,
            details: JobErrorType::Fail,
            created_at: now,
        };
        pipeline.lpush(
            self.handle.job_errors_list_name(job_id),
            serde_json::to_string(&record)?,
        );

        if self.options.idempotency_mode == IdempotencyMode::Active {
            pipeline.srem(self.handle.dedupe_set_name(), job_id);
        }

        Ok(())
    }

    /// Trims a finished-jobs list to `max_len`, deleting everything stored for the evicted ids.
    async fn prune_finished(&self, list_name: String, max_len: usize) -> Result<(), QueueError> {
        let script = redis::Script::new(
            r#"
            local queue_id = KEYS[1]
            local list_name = KEYS[2]
            local job_data_hash = KEYS[3]
            local results_hash = KEYS[4]
            local dedupe_set_name = KEYS[5]
            local max_len = tonumber(ARGV[1])

            local evicted = redis.call('LRANGE', list_name, max_len, -1)
            for _, j_id in ipairs(evicted) do
                redis.call('SREM', dedupe_set_name, j_id)
                redis.call('HDEL', job_data_hash, j_id)
                redis.call('HDEL', results_hash, j_id)
                redis.call('DEL', 'relayq:' .. queue_id .. ':job:' .. j_id .. ':meta')
                redis.call('DEL', 'relayq:' .. queue_id .. ':job:' .. j_id .. ':errors')
            end
            if #evicted > 0 then
                redis.call('LTRIM', list_name, 0, max_len - 1)
            end
            return #evicted
            "#,
        );

        let pruned: usize = script
            .key(self.name())
            .key(&list_name)
            .key(self.handle.job_data_hash_name())
            .key(self.handle.job_result_hash_name())
            .key(self.handle.dedupe_set_name())
            .arg(max_len)
            .invoke_async(&mut self.handle.redis.clone())
            .await?;

        if pruned > 0 {
            tracing::debug!(queue = self.name(), list = list_name, pruned, "Pruned finished jobs");
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job.id(), queue = self.name()))]
    async fn complete_job(
        &self,
        job: &BorrowedJob<H::JobData>,
        result: JobResult<H::Output, H::ErrorData>,
    ) -> Result<(), QueueError> {
        let mut hook_pipeline = redis::pipe();
        let mut tx = TransactionContext::new(&mut hook_pipeline, self.name().to_string());

        match &result {
            Ok(output) => {
                self.handler
                    .on_success(job, SuccessHookData { result: output }, &mut tx)
                    .await;
                self.add_success_operations(job, output, &mut hook_pipeline)?;
            }
            Err(JobError::Nack {
                error,
                delay,
                position,
            }) => {
                let data = NackHookData {
                    error,
                    delay: *delay,
                    position: *position,
                };
                self.handler.on_nack(job, data, &mut tx).await;
                self.add_nack_operations(job, error, *delay, *position, &mut hook_pipeline)?;
            }
            Err(JobError::Fail(error)) => {
                self.handler
                    .on_fail(job, FailHookData { error }, &mut tx)
                    .await;
                self.add_fail_operations(
                    job.id(),
                    job.job.attempts,
                    &job.lease_token,
                    error,
                    &mut hook_pipeline,
                )?;
            }
        }

        let lease_key = self.handle.lease_key_name(job.id(), &job.lease_token);
        if !self.commit_under_lease(&lease_key, hook_pipeline).await? {
            tracing::warn!(job_id = job.id(), "Lease no longer exists, job was cancelled or timed out");
            return Ok(());
        }

        match &result {
            Ok(_) => {
                self.prune_finished(self.handle.success_list_name(), self.options.max_success)
                    .await?
            }
            Err(JobError::Fail(_)) => {
                self.prune_finished(self.handle.failed_list_name(), self.options.max_failed)
                    .await?
            }
            Err(JobError::Nack { .. }) => {}
        }

        tracing::debug!(job_id = job.id(), "Job completion successful");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job.id, queue = self.name()))]
    async fn complete_job_queue_error(
        &self,
        job: &Job<Option<H::JobData>>,
        lease_token: &str,
        error: QueueError,
    ) -> Result<(), QueueError> {
        let mut hook_pipeline = redis::pipe();
        let mut tx = TransactionContext::new(&mut hook_pipeline, self.name().to_string());

        self.handler
            .on_queue_error(job, QueueInternalErrorHookData { error: &error }, &mut tx)
            .await;

        let error_data = H::ErrorData::from(error);
        self.add_fail_operations(&job.id, job.attempts, lease_token, &error_data, &mut hook_pipeline)?;

        let lease_key = self.handle.lease_key_name(&job.id, lease_token);
        if self.commit_under_lease(&lease_key, hook_pipeline).await? {
            self.prune_finished(self.handle.failed_list_name(), self.options.max_failed)
                .await?;
        }
        Ok(())
    }

    /// Executes `pipeline` in MULTI/EXEC while WATCHing the lease key. Returns false when the
    /// lease is already gone.
    async fn commit_under_lease(
        &self,
        lease_key: &str,
        pipeline: Pipeline,
    ) -> Result<bool, QueueError> {
        loop {
            let mut conn = self.handle.redis.clone();

            redis::cmd("WATCH")
                .arg(lease_key)
                .query_async::<()>(&mut conn)
                .await?;

            let lease_exists: bool = conn.exists(lease_key).await?;
            if !lease_exists {
                redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                return Ok(false);
            }

            let mut atomic_pipeline = pipeline.clone();
            atomic_pipeline.atomic();

            match atomic_pipeline
                .query_async::<Option<Vec<redis::Value>>>(&mut conn)
                .await
            {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {
                    tracing::debug!(lease_key, "WATCH aborted completion, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

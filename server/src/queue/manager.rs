use std::{sync::Arc, time::Duration};

use relay_core::{error::EngineError, signer::TransactionSigner};
use relay_executors::{
    RelayServices,
    config::RedisRelayConfigProvider,
    jobs::{MineJobData, RedisJobProducer, SendJobData},
    mine::MineHandler,
    nonce_ledger::RedisNonceLedger,
    send::SendHandler,
    store::RedisTransactionStore,
    usage::{HttpUsageReporter, NoopUsageReporter, UsageReporter},
    webhook::{WebhookJobHandler, WebhookNotifier},
};
use relay_queue::{
    Queue,
    error::QueueError,
    job::JobStatus,
    queue::{IdempotencyMode, QueueHandle, QueueOptions},
    redis::Client,
    shutdown::ShutdownHandle,
};
use serde::Serialize;

use crate::{
    chains::ConfiguredChainService,
    config::{EngineConfig, QueueConfig},
};

const SEND_QUEUE_NAME: &str = "send";
const MINE_QUEUE_NAME: &str = "mine";
const WEBHOOK_QUEUE_NAME: &str = "webhook";

fn get_queue_name_for_namespace(namespace: &Option<String>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{namespace}_{name}"),
        None => name.to_owned(),
    }
}

/// Owns the send, mine and webhook queues and the services their handlers share.
pub struct QueueManager {
    pub send_queue: Arc<Queue<SendHandler<ConfiguredChainService>>>,
    pub mine_queue: Arc<Queue<MineHandler<ConfiguredChainService>>>,
    pub webhook_queue: Arc<Queue<WebhookJobHandler>>,
    pub services: RelayServices,
}

impl QueueManager {
    pub async fn new(
        redis_client: Client,
        config: &EngineConfig,
        chain_service: Arc<ConfiguredChainService>,
        signer: Arc<dyn TransactionSigner>,
    ) -> Result<Self, EngineError> {
        let queue_config = &config.queue;
        let namespace = &queue_config.execution_namespace;
        let redis = redis_client.get_connection_manager().await?;

        let base_queue_opts = QueueOptions {
            local_concurrency: queue_config.send_workers,
            polling_interval: Duration::from_millis(queue_config.polling_interval_ms),
            lease_duration: Duration::from_secs(queue_config.lease_duration_seconds),
            always_poll: queue_config.always_poll,
            max_success: 1000,
            max_failed: 10000,
            idempotency_mode: IdempotencyMode::Permanent,
        };

        let send_queue_opts = QueueOptions {
            idempotency_mode: queue_config.send_idempotency.into(),
            ..base_queue_opts.clone()
        };
        // one live mine job per transaction, released once it finishes
        let mine_queue_opts = QueueOptions {
            local_concurrency: queue_config.mine_workers,
            idempotency_mode: IdempotencyMode::Active,
            ..base_queue_opts.clone()
        };
        let webhook_queue_opts = QueueOptions {
            local_concurrency: queue_config.webhook_workers,
            ..base_queue_opts
        };

        let send_queue_name = get_queue_name_for_namespace(namespace, SEND_QUEUE_NAME);
        let mine_queue_name = get_queue_name_for_namespace(namespace, MINE_QUEUE_NAME);
        let webhook_queue_name = get_queue_name_for_namespace(namespace, WEBHOOK_QUEUE_NAME);

        let webhook_queue = Queue::builder()
            .name(webhook_queue_name)
            .options(webhook_queue_opts)
            .handler(WebhookJobHandler::new(
                reqwest::Client::new(),
                config.webhook.retry.clone(),
            ))
            .redis_connection_manager(redis.clone())
            .build()
            .await?
            .arc();

        // the stages enqueue into each other, so producers come from handles, not queues
        let jobs = RedisJobProducer::new(
            QueueHandle::<SendJobData>::new(redis.clone(), send_queue_name.clone()),
            QueueHandle::<MineJobData>::new(redis.clone(), mine_queue_name.clone()),
            Duration::from_millis(queue_config.mine_poll_delay_ms),
        );

        let usage: Arc<dyn UsageReporter> = match &config.usage.url {
            Some(url) => Arc::new(HttpUsageReporter::new(reqwest::Client::new(), url)),
            None => Arc::new(NoopUsageReporter),
        };

        let services = RelayServices {
            store: Arc::new(RedisTransactionStore::new(redis.clone(), namespace.clone())),
            ledger: Arc::new(RedisNonceLedger::new(redis.clone(), namespace.clone())),
            jobs: Arc::new(jobs),
            signer,
            notifier: Arc::new(WebhookNotifier::new(
                webhook_queue.handle().clone(),
                config.webhook.targets.clone(),
            )),
            usage,
            config: Arc::new(RedisRelayConfigProvider::new(
                redis.clone(),
                namespace.as_deref(),
                config.relay.into(),
            )),
        };

        let send_handler = SendHandler::new(chain_service.clone(), services.clone())
            .with_retry_config(
                queue_config.send_max_attempts,
                Duration::from_millis(queue_config.send_retry_delay_ms),
            );
        let send_queue = Queue::builder()
            .name(send_queue_name)
            .options(send_queue_opts)
            .handler(send_handler)
            .redis_connection_manager(redis.clone())
            .build()
            .await?
            .arc();

        let mine_handler = MineHandler::new(chain_service, services.clone()).with_retry_config(
            queue_config.mine_max_attempts,
            Duration::from_millis(queue_config.mine_poll_delay_ms),
        );
        let mine_queue = Queue::builder()
            .name(mine_queue_name)
            .options(mine_queue_opts)
            .handler(mine_handler)
            .redis_connection_manager(redis)
            .build()
            .await?
            .arc();

        Ok(Self {
            send_queue,
            mine_queue,
            webhook_queue,
            services,
        })
    }

    /// Start all workers
    pub fn start_workers(&self, queue_config: &QueueConfig) -> ShutdownHandle {
        tracing::info!("Starting send worker");
        let send_worker = self.send_queue.work();

        tracing::info!("Starting mine worker");
        let mine_worker = self.mine_queue.work();

        tracing::info!("Starting webhook worker");
        let webhook_worker = self.webhook_queue.work();

        tracing::info!(
            send_workers = queue_config.send_workers,
            mine_workers = queue_config.mine_workers,
            webhook_workers = queue_config.webhook_workers,
            "Started queue workers"
        );

        ShutdownHandle::new()
            .and_worker(send_worker)
            .and_worker(mine_worker)
            .and_worker(webhook_worker)
    }

    /// Get queue statistics for monitoring
    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            send: statistics(self.send_queue.handle()).await?,
            mine: statistics(self.mine_queue.handle()).await?,
            webhook: statistics(self.webhook_queue.handle()).await?,
        })
    }
}

async fn statistics<T>(queue: &QueueHandle<T>) -> Result<QueueStatistics, QueueError> {
    Ok(QueueStatistics {
        pending: queue.count(JobStatus::Pending).await?,
        active: queue.count(JobStatus::Active).await?,
        delayed: queue.count(JobStatus::Delayed).await?,
        success: queue.count(JobStatus::Success).await?,
        failed: queue.count(JobStatus::Failed).await?,
    })
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub send: QueueStatistics,
    pub mine: QueueStatistics,
    pub webhook: QueueStatistics,
}

#[derive(Debug, Serialize)]
pub struct QueueStatistics {
    pub pending: usize,
    pub active: usize,
    pub delayed: usize,
    pub success: usize,
    pub failed: usize,
}

use std::time::Duration;

use async_trait::async_trait;
use relay_core::error::EngineError;
use relay_queue::{
    job::{DelayOptions, JobOptions, PushOutcome},
    queue::{CancelResult, QueueHandle},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendJobData {
    pub queue_id: String,
    pub resend_count: u32,
}

impl SendJobData {
    /// Send jobs are addressed by `{queueId}.{resendCount}`, so each resend is a distinct job.
    pub fn job_id(&self) -> String {
        send_job_id(&self.queue_id, self.resend_count)
    }
}

pub fn send_job_id(queue_id: &str, resend_count: u32) -> String {
    format!("{queue_id}.{resend_count}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MineJobData {
    pub queue_id: String,
}

/// How stages hand work to each other.
#[async_trait]
pub trait JobProducer: Send + Sync {
    async fn enqueue_send(&self, job: SendJobData) -> Result<(), EngineError>;

    /// There is at most one live mine job per queue id; enqueueing again is a no-op.
    async fn enqueue_mine(&self, job: MineJobData) -> Result<(), EngineError>;

    /// Returns whether a job that had not started yet was removed.
    async fn remove_send(&self, queue_id: &str, resend_count: u32) -> Result<bool, EngineError>;
}

pub struct RedisJobProducer {
    send: QueueHandle<SendJobData>,
    mine: QueueHandle<MineJobData>,
    mine_poll_delay: Duration,
}

impl RedisJobProducer {
    pub fn new(
        send: QueueHandle<SendJobData>,
        mine: QueueHandle<MineJobData>,
        mine_poll_delay: Duration,
    ) -> Self {
        Self {
            send,
            mine,
            mine_poll_delay,
        }
    }
}

#[async_trait]
impl JobProducer for RedisJobProducer {
    async fn enqueue_send(&self, job: SendJobData) -> Result<(), EngineError> {
        let id = job.job_id();
        let outcome = self.send.push(JobOptions::new(job).with_id(&id)).await?;
        if outcome == PushOutcome::Duplicate {
            tracing::debug!(job_id = id, "Send job already queued");
        }
        Ok(())
    }

    async fn enqueue_mine(&self, job: MineJobData) -> Result<(), EngineError> {
        let id = job.queue_id.clone();
        let outcome = self
            .mine
            .push(
                JobOptions::new(job)
                    .with_id(&id)
                    .with_delay(DelayOptions::last(self.mine_poll_delay)),
            )
            .await?;
        if outcome == PushOutcome::Duplicate {
            tracing::debug!(job_id = id, "Mine job already live");
        }
        Ok(())
    }

    async fn remove_send(&self, queue_id: &str, resend_count: u32) -> Result<bool, EngineError> {
        let id = send_job_id(queue_id, resend_count);
        let result = self.send.cancel_job(&id).await?;
        tracing::debug!(job_id = id, result = ?result, "Removed send job");
        Ok(result == CancelResult::CancelledImmediately)
    }
}

use std::{fmt::Display, time::Duration};

use nanoid::nanoid;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{error::QueueError, queue::QueueHandle};

/// Where a re-queued job lands in the pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequeuePosition {
    #[serde(rename = "first")]
    First,
    #[serde(rename = "last")]
    Last,
}

impl Display for RequeuePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequeuePosition::First => write!(f, "first"),
            RequeuePosition::Last => write!(f, "last"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayOptions {
    pub delay: Duration,
    pub position: RequeuePosition,
}

impl DelayOptions {
    pub fn last(delay: Duration) -> Self {
        Self {
            delay,
            position: RequeuePosition::Last,
        }
    }
}

pub type JobResult<T, E> = Result<T, JobError<E>>;

#[derive(Debug)]
pub enum JobError<E> {
    Nack {
        error: E,
        delay: Option<Duration>,
        position: RequeuePosition,
    },
    Fail(E),
}

impl<E> JobError<E> {
    pub fn error(&self) -> &E {
        match self {
            JobError::Nack { error, .. } => error,
            JobError::Fail(error) => error,
        }
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, JobError::Nack { .. })
    }
}

pub trait ToJobResult<T, E> {
    fn map_err_nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobResult<T, E>;
    fn map_err_fail(self) -> JobResult<T, E>;
}

impl<T, E> ToJobResult<T, E> for Result<T, E> {
    fn map_err_nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobResult<T, E> {
        self.map_err(|e| JobError::Nack {
            error: e,
            delay,
            position,
        })
    }

    fn map_err_fail(self) -> JobResult<T, E> {
        self.map_err(JobError::Fail)
    }
}

pub trait ToJobError<E> {
    fn nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobError<E>;
    fn fail(self) -> JobError<E>;
}

impl<E> ToJobError<E> for E {
    fn nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobError<E> {
        JobError::Nack {
            error: self,
            delay,
            position,
        }
    }

    fn fail(self) -> JobError<E> {
        JobError::Fail(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueOptions {
    pub delay: Option<Duration>,
    pub position: RequeuePosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobErrorType {
    #[serde(rename = "nack")]
    Nack(RequeueOptions),
    #[serde(rename = "fail")]
    Fail,
}

/// One entry of a job's error history, newest first in Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorRecord<E> {
    pub error: E,
    pub attempt: u32,
    pub details: JobErrorType,
    pub created_at: u64,
}

/// A job as stored in the queue. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<T> {
    pub id: String,
    pub data: T,
    /// Number of deliveries so far, including the current one while it is being processed.
    pub attempts: u32,
    pub created_at: u64,
    pub processed_at: Option<u64>,
    pub finished_at: Option<u64>,
}

/// A job leased to a worker. The lease token proves ownership when the job completes.
#[derive(Debug, Clone)]
pub struct BorrowedJob<T> {
    pub job: Job<T>,
    pub lease_token: String,
}

impl<T> BorrowedJob<T> {
    pub fn new(job: Job<T>, lease_token: String) -> Self {
        Self { job, lease_token }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn data(&self) -> &T {
        &self.job.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Active,
    Delayed,
    Success,
    Failed,
}

pub struct JobOptions<T> {
    pub data: T,
    pub id: String,
    pub delay: Option<DelayOptions>,
}

impl<T> JobOptions<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            id: nanoid!(),
            delay: None,
        }
    }

    /// Jobs sharing an id are deduplicated by the queue.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_delay(mut self, delay: DelayOptions) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Outcome of a push. A duplicate id leaves the existing job untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Duplicate,
}

pub struct PushableJob<T> {
    pub options: JobOptions<T>,
    pub queue: QueueHandle<T>,
}

impl<T> PushableJob<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub async fn push(self) -> Result<PushOutcome, QueueError> {
        self.queue.push(self.options).await
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.options.id = id.into();
        self
    }

    pub fn with_delay(mut self, delay: DelayOptions) -> Self {
        self.options.delay = Some(delay);
        self
    }
}

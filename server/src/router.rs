use std::sync::Arc;

use chrono::Utc;
use relay_core::{
    chain::ChainService,
    error::EngineError,
    transaction::{SubmitTransactionRequest, TransactionRecord, TransactionStatus},
};
use relay_executors::{
    RelayServices,
    cancel::{CancelError, CancelResponse, CancellationFlow},
    jobs::SendJobData,
    store::StoreError,
};
use serde::Serialize;
use thiserror::Error;

/// Caller-facing failures of the relay entry points.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayError {
    #[error("Transaction not found.")]
    #[serde(rename_all = "camelCase")]
    TransactionNotFound { queue_id: String },

    #[error("Transaction cannot be cancelled.")]
    #[serde(rename = "TRANSACTION_CANNOT_BE_CANCELLED", rename_all = "camelCase")]
    CannotBeCancelled { queue_id: String, reason: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::TransactionNotFound { .. } => "TRANSACTION_NOT_FOUND",
            RelayError::CannotBeCancelled { .. } => "TRANSACTION_CANNOT_BE_CANCELLED",
            RelayError::ValidationError { .. } => "VALIDATION_ERROR",
            RelayError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::TransactionNotFound { .. } => 404,
            RelayError::CannotBeCancelled { .. } | RelayError::ValidationError { .. } => 400,
            RelayError::InternalError { .. } => 500,
        }
    }
}

impl From<EngineError> for RelayError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::ValidationError { message } => RelayError::ValidationError { message },
            other => RelayError::InternalError {
                message: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { queue_id } => RelayError::TransactionNotFound { queue_id },
            other => RelayError::InternalError {
                message: other.to_string(),
            },
        }
    }
}

impl From<CancelError> for RelayError {
    fn from(error: CancelError) -> Self {
        match error {
            CancelError::NotFound { queue_id } => RelayError::TransactionNotFound { queue_id },
            CancelError::CannotBeCancelled { queue_id, reason } => {
                RelayError::CannotBeCancelled { queue_id, reason }
            }
            CancelError::Engine(e) => e.into(),
        }
    }
}

/// Submission, cancellation and status entry points in front of the pipeline.
pub struct RelayRouter<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    chain_service: Arc<CS>,
    services: RelayServices,
    cancellation: CancellationFlow<CS>,
}

impl<CS> RelayRouter<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    pub fn new(chain_service: Arc<CS>, services: RelayServices) -> Self {
        Self {
            cancellation: CancellationFlow::new(chain_service.clone(), services.clone()),
            chain_service,
            services,
        }
    }

    fn validate(&self, request: &SubmitTransactionRequest) -> Result<(), RelayError> {
        if let Err(e) = self.chain_service.get_chain(request.chain_id) {
            return Err(RelayError::ValidationError {
                message: e.to_string(),
            });
        }
        if request.user_operation.is_none() && request.to.is_none() && request.data.is_empty() {
            return Err(RelayError::ValidationError {
                message: "Deployment transactions require calldata".to_string(),
            });
        }
        Ok(())
    }

    /// Stores a `queued` record and enqueues its first send. Returns the queue id.
    ///
    /// Resubmitting with the same idempotency key returns the original queue id. While that
    /// transaction is still queued its first send job is enqueued again, which the queue dedupes.
    #[tracing::instrument(skip_all, fields(chain_id = request.chain_id, from = %request.from))]
    pub async fn submit(&self, request: SubmitTransactionRequest) -> Result<String, RelayError> {
        self.validate(&request)?;

        let idempotent = request.idempotency_key.is_some();
        let queue_id = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let record = TransactionRecord::queued(queue_id.clone(), request, Utc::now());
        match self.services.store.insert(&record).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) if idempotent => {
                let existing = self.get_transaction(&queue_id).await?;
                if existing.status != TransactionStatus::Queued {
                    tracing::debug!(queue_id, "Duplicate submission, returning existing transaction");
                    return Ok(queue_id);
                }
                // the first submission may have stored the record without its send job
                tracing::debug!(queue_id, "Duplicate submission of a queued transaction, ensuring send job");
            }
            Err(e) => return Err(e.into()),
        }

        self.services
            .jobs
            .enqueue_send(SendJobData {
                queue_id: queue_id.clone(),
                resend_count: 0,
            })
            .await?;

        tracing::info!(queue_id, "Transaction queued");
        Ok(queue_id)
    }

    /// Each request is handled independently; one failure does not affect the others.
    pub async fn submit_batch(
        &self,
        requests: Vec<SubmitTransactionRequest>,
    ) -> Vec<Result<String, RelayError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.submit(request).await);
        }
        results
    }

    pub async fn cancel(&self, queue_id: &str) -> Result<CancelResponse, RelayError> {
        Ok(self.cancellation.cancel(queue_id).await?)
    }

    pub async fn get_transaction(&self, queue_id: &str) -> Result<TransactionRecord, RelayError> {
        self.services
            .store
            .get(queue_id)
            .await?
            .ok_or_else(|| RelayError::TransactionNotFound {
                queue_id: queue_id.to_string(),
            })
    }
}

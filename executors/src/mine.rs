use std::{sync::Arc, time::Duration};

use alloy::primitives::B256;
use chrono::Utc;
use futures::future::join_all;
use relay_core::{
    chain::{Chain, ChainService, ReceiptSummary},
    error::EngineError,
    transaction::{OnchainStatus, TransactionRecord, TransactionStatus},
};
use relay_queue::{
    DurableExecution, FailHookData, NackHookData, SuccessHookData, UserCancellable,
    error::QueueError,
    hooks::TransactionContext,
    job::{BorrowedJob, JobError, JobResult, RequeuePosition},
};
use serde::{Deserialize, Serialize};

use crate::{
    RelayServices,
    jobs::{MineJobData, SendJobData},
    store::update_with,
    terminal::TerminalFailureHandler,
    usage::UsageEvent,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum MineOutcome {
    Mined {
        transaction_hash: B256,
        block_number: u64,
        onchain_status: OnchainStatus,
    },
    Skipped {
        status: TransactionStatus,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum MineError {
    #[error("Transaction {queue_id} not found")]
    #[serde(rename_all = "camelCase")]
    TransactionNotFound { queue_id: String },

    #[error("Not mined yet (attempt {attempt})")]
    NotYetMined { attempt: u32 },

    #[error("Transaction not mined after {attempts} polls")]
    TimedOut { attempts: u32 },

    #[error("Chain error: {message}")]
    #[serde(rename_all = "camelCase")]
    ChainError { chain_id: u64, message: String },

    #[error("Nonce ledger error: {message}")]
    NonceLedgerError { message: String },

    #[error("Record store error: {message}")]
    StoreError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Mine job cancelled")]
    UserCancelled,
}

impl From<QueueError> for MineError {
    fn from(error: QueueError) -> Self {
        MineError::InternalError {
            message: error.to_string(),
        }
    }
}

impl UserCancellable for MineError {
    fn user_cancelled() -> Self {
        MineError::UserCancelled
    }
}

/// Mined fields stamped onto the record.
struct Inclusion {
    receipt: ReceiptSummary,
    onchain_status: OnchainStatus,
    user_op: Option<(alloy::primitives::Address, String)>,
}

/// Polls chain state for sent transactions: finalizes them, requests resends, or hands them to
/// the terminal handler once polling is exhausted.
pub struct MineHandler<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    pub chain_service: Arc<CS>,
    pub services: RelayServices,
    pub terminal: TerminalFailureHandler,
    pub max_attempts: u32,
    pub poll_delay: Duration,
}

impl<CS> MineHandler<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    pub fn new(chain_service: Arc<CS>, services: RelayServices) -> Self {
        Self {
            chain_service,
            terminal: TerminalFailureHandler::new(services.clone()),
            services,
            max_attempts: 100,
            poll_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retry_config(mut self, max_attempts: u32, poll_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.poll_delay = poll_delay;
        self
    }

    /// Polls again later, or times out once the attempt budget is spent.
    fn poll_again<T>(
        &self,
        job: &BorrowedJob<MineJobData>,
        error: MineError,
    ) -> JobResult<T, MineError> {
        if job.job.attempts >= self.max_attempts {
            return Err(JobError::Fail(MineError::TimedOut {
                attempts: job.job.attempts,
            }));
        }
        Err(JobError::Nack {
            error,
            delay: Some(self.poll_delay),
            position: RequeuePosition::Last,
        })
    }

    fn not_yet_mined<T>(&self, job: &BorrowedJob<MineJobData>) -> JobResult<T, MineError> {
        self.poll_again(
            job,
            MineError::NotYetMined {
                attempt: job.job.attempts,
            },
        )
    }

    /// Looks up every broadcast hash at once; the first receipt found wins, since only one
    /// transaction per nonce can ever be included.
    async fn find_receipt(
        &self,
        chain: &impl Chain,
        record: &TransactionRecord,
    ) -> Result<Option<ReceiptSummary>, EngineError> {
        let lookups = record
            .sent_transaction_hashes
            .iter()
            .map(|hash| chain.transaction_receipt(*hash));
        let results = join_all(lookups).await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(receipt)) => return Ok(Some(receipt)),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn check_transaction(
        &self,
        job: &BorrowedJob<MineJobData>,
        chain: &impl Chain,
        record: TransactionRecord,
    ) -> JobResult<MineOutcome, MineError> {
        let receipt = match self.find_receipt(chain, &record).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(error = %e, "Receipt lookup failed");
                None
            }
        };

        let Some(receipt) = receipt else {
            self.maybe_request_resend(chain, &record).await;
            return self.not_yet_mined(job);
        };

        // consumed on chain: out of the in-flight set, never recycled
        if let Some(nonce) = record.assigned_nonce() {
            if let Err(e) = self
                .services
                .ledger
                .remove_from_in_flight(record.chain_id, record.from, nonce)
                .await
            {
                return self.poll_again(
                    job,
                    MineError::NonceLedgerError {
                        message: e.to_string(),
                    },
                );
            }
        }

        let onchain_status = receipt.status;
        self.finalize(
            job,
            record,
            Inclusion {
                receipt,
                onchain_status,
                user_op: None,
            },
        )
        .await
    }

    /// Enqueues the next resend once enough blocks have passed without inclusion.
    async fn maybe_request_resend(&self, chain: &impl Chain, record: &TransactionRecord) {
        let config = match self.services.config.relay_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read relay config, skipping resend check");
                return;
            }
        };

        if record.resend_count >= config.max_retries_per_tx {
            return;
        }

        let current_block = match chain.block_number().await {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read block number, skipping resend check");
                return;
            }
        };

        let elapsed = current_block.saturating_sub(record.sent_at_block.unwrap_or(current_block));
        if elapsed < config.min_elapsed_blocks_before_retry {
            tracing::debug!(
                elapsed_blocks = elapsed,
                required = config.min_elapsed_blocks_before_retry,
                "Waiting before resend"
            );
            return;
        }

        let next = SendJobData {
            queue_id: record.queue_id.clone(),
            resend_count: record.resend_count + 1,
        };
        match self.services.jobs.enqueue_send(next).await {
            Ok(()) => tracing::info!(
                elapsed_blocks = elapsed,
                resend_count = record.resend_count + 1,
                "Requested resend"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to enqueue resend"),
        }
    }

    async fn check_user_operation(
        &self,
        job: &BorrowedJob<MineJobData>,
        chain: &impl Chain,
        record: TransactionRecord,
    ) -> JobResult<MineOutcome, MineError> {
        let Some(user_op_hash) = record.user_op_hash else {
            return Err(JobError::Fail(MineError::InternalError {
                message: "Sent user operation has no user operation hash".to_string(),
            }));
        };
        let to_chain_error = |e: EngineError| MineError::ChainError {
            chain_id: record.chain_id,
            message: e.to_string(),
        };

        let op_receipt = match chain.user_operation_receipt(user_op_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return self.not_yet_mined(job),
            Err(e) => return self.poll_again(job, to_chain_error(e)),
        };

        let included = match chain.transaction_by_hash(op_receipt.transaction_hash).await {
            Ok(tx) => tx.is_some_and(|tx| tx.block_number.is_some()),
            Err(e) => return self.poll_again(job, to_chain_error(e)),
        };
        if !included {
            return self.not_yet_mined(job);
        }

        let receipt = match chain.transaction_receipt(op_receipt.transaction_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return self.not_yet_mined(job),
            Err(e) => return self.poll_again(job, to_chain_error(e)),
        };

        self.finalize(
            job,
            record,
            Inclusion {
                receipt,
                onchain_status: OnchainStatus::from(op_receipt.success),
                user_op: Some((op_receipt.sender, op_receipt.nonce)),
            },
        )
        .await
    }

    async fn finalize(
        &self,
        job: &BorrowedJob<MineJobData>,
        record: TransactionRecord,
        inclusion: Inclusion,
    ) -> JobResult<MineOutcome, MineError> {
        let now = Utc::now();
        let receipt = &inclusion.receipt;
        let mut observed = record.status;

        let updated = update_with(self.services.store.as_ref(), record, |r| {
            observed = r.status;
            if r.status != TransactionStatus::Sent {
                return false;
            }
            r.status = TransactionStatus::Mined;
            r.mined_at = Some(now);
            r.transaction_hash = Some(receipt.transaction_hash);
            r.mined_at_block = Some(receipt.block_number);
            r.onchain_status = Some(inclusion.onchain_status);
            r.gas_used = Some(receipt.gas_used);
            r.effective_gas_price = Some(receipt.effective_gas_price);
            r.cumulative_gas_used = Some(receipt.cumulative_gas_used);
            r.transaction_type = Some(receipt.transaction_type);
            if let Some((sender, nonce)) = &inclusion.user_op {
                r.sender = Some(*sender);
                r.user_op_nonce = Some(nonce.clone());
            }
            true
        })
        .await;

        let record = match updated {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(status = %observed, "Record left sent before it could be marked mined");
                return Ok(MineOutcome::Skipped { status: observed });
            }
            Err(e) => {
                return self.poll_again(
                    job,
                    MineError::StoreError {
                        message: e.to_string(),
                    },
                );
            }
        };

        tracing::info!(
            transaction_hash = %receipt.transaction_hash,
            block_number = receipt.block_number,
            onchain_status = ?inclusion.onchain_status,
            "Transaction mined"
        );

        self.services.notifier.notify(&record);
        self.services.usage.report(UsageEvent::mined(&record, now));

        Ok(MineOutcome::Mined {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            onchain_status: inclusion.onchain_status,
        })
    }
}

impl<CS> DurableExecution for MineHandler<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    type Output = MineOutcome;
    type ErrorData = MineError;
    type JobData = MineJobData;

    #[tracing::instrument(skip_all, fields(
        queue_id = job.job.data.queue_id,
        attempt = job.job.attempts,
        stage = "mine",
        executor = "relay"
    ))]
    async fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> JobResult<Self::Output, Self::ErrorData> {
        let queue_id = &job.job.data.queue_id;

        let record = match self.services.store.get(queue_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(JobError::Fail(MineError::TransactionNotFound {
                    queue_id: queue_id.clone(),
                }));
            }
            Err(e) => {
                return self.poll_again(
                    job,
                    MineError::StoreError {
                        message: e.to_string(),
                    },
                );
            }
        };

        if record.status != TransactionStatus::Sent {
            tracing::debug!(status = %record.status, "Stale mine job, nothing to do");
            return Ok(MineOutcome::Skipped {
                status: record.status,
            });
        }

        let chain = match self.chain_service.get_chain(record.chain_id) {
            Ok(chain) => chain,
            Err(e) => {
                return self.poll_again(
                    job,
                    MineError::ChainError {
                        chain_id: record.chain_id,
                        message: format!("Failed to get chain instance: {e}"),
                    },
                );
            }
        };

        if record.is_user_op {
            self.check_user_operation(job, &chain, record).await
        } else {
            self.check_transaction(job, &chain, record).await
        }
    }

    async fn on_success(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: SuccessHookData<'_, Self::Output>,
        _tx: &mut TransactionContext<'_>,
    ) {
        tracing::debug!(job_id = job.job.id, outcome = ?d.result, "Mine job completed");
    }

    async fn on_nack(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: NackHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) {
        if !matches!(d.error, MineError::NotYetMined { .. }) {
            tracing::warn!(job_id = job.job.id, attempt = job.job.attempts, error = %d.error, "Mine poll failed");
        }
    }

    async fn on_fail(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: FailHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) {
        if matches!(d.error, MineError::UserCancelled) {
            return;
        }

        tracing::error!(
            job_id = job.job.id,
            attempt = job.job.attempts,
            error = %d.error,
            "Mine job failed, finalizing transaction"
        );

        if let Err(e) = self.terminal.handle(&job.job.data.queue_id).await {
            tracing::error!(
                queue_id = job.job.data.queue_id,
                error = %e,
                "Terminal failure handling failed"
            );
        }
    }
}

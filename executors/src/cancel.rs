use std::sync::Arc;

use alloy::primitives::B256;
use chrono::Utc;
use relay_core::{
    chain::{Chain, ChainService},
    error::EngineError,
    transaction::{CANCELLED_WHILE_QUEUED_NONCE, GasParams, TransactionRecord, TransactionStatus},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    RelayServices,
    error_classifier::{BroadcastErrorClassifier, BroadcastErrorKind},
    fees::cancellation_fees,
    send::{build_transaction, noop_request},
    store::update_with,
    usage::UsageEvent,
};

/// Gas for a zero-value transfer with no calldata.
pub const CANCELLATION_GAS_LIMIT: u64 = 21_000;

pub const CANCELLED_MESSAGE: &str = "Transaction successfully cancelled.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub queue_id: String,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<B256>,
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Transaction not found.")]
    NotFound { queue_id: String },

    #[error("Transaction cannot be cancelled.")]
    CannotBeCancelled { queue_id: String, reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<crate::store::StoreError> for CancelError {
    fn from(err: crate::store::StoreError) -> Self {
        CancelError::Engine(err.into())
    }
}

/// Sent, or queued with a nonce already claimed by the send stage.
fn holds_nonce(record: &TransactionRecord) -> bool {
    match record.status {
        TransactionStatus::Sent => true,
        TransactionStatus::Queued => record.assigned_nonce().is_some(),
        _ => false,
    }
}

fn cannot_cancel(queue_id: &str, reason: impl Into<String>) -> CancelError {
    CancelError::CannotBeCancelled {
        queue_id: queue_id.to_string(),
        reason: reason.into(),
    }
}

/// Out-of-band cancellation racing the send and mine stages.
///
/// A queued transaction is cancelled by removing its send jobs. One that holds a nonce (sent, or
/// queued with a nonce claimed by the send stage) is replaced at that nonce with an empty self
/// transfer that pays more.
pub struct CancellationFlow<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    chain_service: Arc<CS>,
    services: RelayServices,
}

impl<CS> CancellationFlow<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    pub fn new(chain_service: Arc<CS>, services: RelayServices) -> Self {
        Self {
            chain_service,
            services,
        }
    }

    #[tracing::instrument(skip_all, fields(queue_id = queue_id, stage = "cancel", executor = "relay"))]
    pub async fn cancel(&self, queue_id: &str) -> Result<CancelResponse, CancelError> {
        let record = self.load(queue_id).await?;

        let cancelled = match record.status {
            TransactionStatus::Queued if record.assigned_nonce().is_none() => {
                match self.cancel_queued(record).await? {
                    Some(cancelled) => cancelled,
                    // picked up by the send stage meanwhile
                    None => {
                        let record = self.load(queue_id).await?;
                        if !holds_nonce(&record) {
                            return Err(cannot_cancel(
                                queue_id,
                                format!("status is {}", record.status),
                            ));
                        }
                        self.cancel_by_replacement(record).await?
                    }
                }
            }
            TransactionStatus::Queued | TransactionStatus::Sent => {
                self.cancel_by_replacement(record).await?
            }
            status => return Err(cannot_cancel(queue_id, format!("status is {status}"))),
        };

        tracing::info!(
            transaction_hash = ?cancelled.last_sent_hash(),
            "Transaction cancelled"
        );

        self.services.notifier.notify(&cancelled);
        self.services
            .usage
            .report(UsageEvent::cancelled(&cancelled, Utc::now()));

        Ok(CancelResponse {
            queue_id: cancelled.queue_id.clone(),
            status: "success".to_string(),
            message: CANCELLED_MESSAGE.to_string(),
            transaction_hash: cancelled.last_sent_hash(),
        })
    }

    async fn load(&self, queue_id: &str) -> Result<TransactionRecord, CancelError> {
        self.services
            .store
            .get(queue_id)
            .await?
            .ok_or_else(|| CancelError::NotFound {
                queue_id: queue_id.to_string(),
            })
    }

    /// Returns `None` if the record left `queued` before it could be marked.
    async fn cancel_queued(
        &self,
        record: TransactionRecord,
    ) -> Result<Option<TransactionRecord>, CancelError> {
        let config = self.services.config.relay_config().await?;

        let current_block = match self.chain_service.get_chain(record.chain_id) {
            Ok(chain) => chain.block_number().await.ok(),
            Err(_) => None,
        };

        self.remove_send_jobs(&record.queue_id, config.max_retries_per_tx)
            .await?;

        let now = Utc::now();
        let cancelled = update_with(self.services.store.as_ref(), record, |r| {
            // a claimed nonce may already be broadcast and needs a replacement
            if r.status != TransactionStatus::Queued || r.assigned_nonce().is_some() {
                return false;
            }
            r.status = TransactionStatus::Cancelled;
            r.cancelled_at = Some(now);
            r.sent_at = Some(now);
            r.sent_at_block = current_block;
            r.nonce = Some(CANCELLED_WHILE_QUEUED_NONCE);
            r.sent_transaction_hashes.clear();
            true
        })
        .await?;

        Ok(cancelled)
    }

    async fn remove_send_jobs(&self, queue_id: &str, max_retries_per_tx: u32) -> Result<(), CancelError> {
        // send jobs are addressed per resend count, so sweep the whole configured range
        for resend_count in 0..=max_retries_per_tx {
            let removed = self.services.jobs.remove_send(queue_id, resend_count).await?;
            if removed {
                tracing::debug!(resend_count, "Removed pending send job");
            }
        }
        Ok(())
    }

    /// Replaces whatever holds the record's nonce with an empty self transfer.
    ///
    /// Covers sent transactions and queued ones whose send already claimed a nonce.
    async fn cancel_by_replacement(
        &self,
        record: TransactionRecord,
    ) -> Result<TransactionRecord, CancelError> {
        let queue_id = record.queue_id.clone();

        if record.is_user_op {
            return Err(cannot_cancel(&queue_id, "user operation already submitted to bundler"));
        }
        let Some(nonce) = record.assigned_nonce() else {
            return Err(cannot_cancel(&queue_id, "no nonce assigned"));
        };

        if record.status == TransactionStatus::Queued {
            let config = self.services.config.relay_config().await?;
            self.remove_send_jobs(&queue_id, config.max_retries_per_tx)
                .await?;
        }

        let chain = self.chain_service.get_chain(record.chain_id)?;
        let fees = cancellation_fees(&record, chain.estimate_fees().await?);

        let tx = build_transaction(noop_request(&record), nonce, CANCELLATION_GAS_LIMIT, fees)?;
        let signed = self.services.signer.sign_transaction(record.from, tx).await?;

        if let Err(e) = chain.send_raw_transaction(&signed.raw).await {
            let classified = BroadcastErrorClassifier::classify(&e);
            if classified.kind != BroadcastErrorKind::AlreadyKnown {
                tracing::warn!(
                    nonce,
                    kind = ?classified.kind,
                    error = classified.message,
                    "Cancellation replacement rejected"
                );
                return Err(cannot_cancel(&queue_id, classified.message));
            }
        }

        tracing::info!(nonce, transaction_hash = %signed.hash, "Cancellation replacement broadcast");

        // the replacement occupies the nonce now, so it stays in flight
        let now = Utc::now();
        let cancelled = update_with(self.services.store.as_ref(), record, |r| {
            if !holds_nonce(r) || r.assigned_nonce() != Some(nonce) {
                return false;
            }
            r.status = TransactionStatus::Cancelled;
            r.cancelled_at = Some(now);
            r.sent_at.get_or_insert(now);
            r.sent_transaction_hashes.push(signed.hash);
            r.sent_gas = Some(GasParams {
                gas_limit: CANCELLATION_GAS_LIMIT,
                max_fee_per_gas: fees.max_fee_per_gas,
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            });
            true
        })
        .await?;

        cancelled.ok_or_else(|| {
            tracing::warn!(
                nonce,
                transaction_hash = %signed.hash,
                "Transaction finalized while its replacement was broadcast"
            );
            cannot_cancel(&queue_id, "transaction was finalized during cancellation")
        })
    }
}

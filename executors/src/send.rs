use std::{sync::Arc, time::Duration};

use alloy::{
    consensus::TypedTransaction,
    primitives::{Address, B256, Bytes, TxKind, U256},
    rpc::types::TransactionRequest,
};
use chrono::Utc;
use relay_core::{
    chain::{Chain, ChainService},
    error::EngineError,
    transaction::{GasParams, TransactionRecord, TransactionStatus},
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
    error_classifier::{BroadcastErrorClassifier, BroadcastErrorKind, RecoveryStrategy},
    fees::{FeeChoice, first_send_fees, resend_fees},
    jobs::{MineJobData, SendJobData},
    nonce_ledger::NonceLedgerError,
    store::update_with,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum SendOutcome {
    /// `hash` is the transaction hash, or the user operation hash for user operations.
    Sent {
        hash: B256,
        nonce: Option<u64>,
        resend_count: u32,
    },
    Skipped { reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum SendError {
    #[error("Transaction {queue_id} not found")]
    #[serde(rename_all = "camelCase")]
    TransactionNotFound { queue_id: String },

    #[error("Invalid transaction: {message}")]
    InvalidTransaction { message: String },

    #[error("Chain error: {message}")]
    #[serde(rename_all = "camelCase")]
    ChainError { chain_id: u64, message: String },

    #[error("Nonce ledger error: {message}")]
    NonceLedgerError { message: String },

    #[error("Signing failed: {message}")]
    SigningFailed { message: String },

    #[error("Broadcast rejected ({kind:?}): {message}")]
    BroadcastRejected {
        kind: BroadcastErrorKind,
        message: String,
    },

    #[error("Record store error: {message}")]
    StoreError { message: String },

    #[error("Transaction {transaction_hash} was broadcast but its record could not be updated: {message}")]
    #[serde(rename_all = "camelCase")]
    RecordUpdateFailed {
        transaction_hash: B256,
        nonce: Option<u64>,
        message: String,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Send cancelled")]
    UserCancelled,
}

impl From<QueueError> for SendError {
    fn from(error: QueueError) -> Self {
        SendError::InternalError {
            message: error.to_string(),
        }
    }
}

impl UserCancellable for SendError {
    fn user_cancelled() -> Self {
        SendError::UserCancelled
    }
}

impl From<crate::store::StoreError> for SendError {
    fn from(error: crate::store::StoreError) -> Self {
        SendError::StoreError {
            message: error.to_string(),
        }
    }
}

fn chain_error(chain_id: u64) -> impl Fn(EngineError) -> SendError {
    move |e| SendError::ChainError {
        chain_id,
        message: e.to_string(),
    }
}

/// Whether a send job may act on the record as it is now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eligibility {
    Send,
    /// An earlier delivery of this job already broadcast and recorded it.
    AlreadySent,
    Stale,
}

pub(crate) fn eligibility(record: &TransactionRecord, resend_count: u32) -> Eligibility {
    match record.status {
        TransactionStatus::Queued if resend_count == 0 => Eligibility::Send,
        TransactionStatus::Sent if record.resend_count == resend_count => Eligibility::AlreadySent,
        TransactionStatus::Sent if !record.is_user_op && record.resend_count + 1 == resend_count => {
            Eligibility::Send
        }
        _ => Eligibility::Stale,
    }
}

/// EIP-1559 transaction for `request` at `nonce`.
pub(crate) fn build_transaction(
    request: TransactionRequest,
    nonce: u64,
    gas_limit: u64,
    fees: FeeChoice,
) -> Result<TypedTransaction, EngineError> {
    TransactionRequest {
        nonce: Some(nonce),
        gas: Some(gas_limit),
        max_fee_per_gas: Some(fees.max_fee_per_gas),
        max_priority_fee_per_gas: Some(fees.max_priority_fee_per_gas),
        ..request
    }
    .build_typed_tx()
    .map_err(|_| EngineError::ValidationError {
        message: "Transaction request is missing fields required for signing".to_string(),
    })
}

/// Zero-value self transfer, the body of a cancellation replacement.
pub(crate) fn noop_request(record: &TransactionRecord) -> TransactionRequest {
    TransactionRequest {
        to: Some(TxKind::Call(record.from)),
        value: Some(U256::ZERO),
        input: Bytes::new().into(),
        ..record.to_rpc_request()
    }
}

/// A nonce pinned on a queued record, with the gas every delivery signs it with.
struct NonceClaim {
    record: TransactionRecord,
    nonce: u64,
    gas: GasParams,
    /// Claimed by an earlier or concurrent delivery of the same job.
    inherited: bool,
}

/// What a successful broadcast changes on the record.
struct Broadcast {
    hash: B256,
    nonce: u64,
    block: u64,
    gas: GasParams,
}

/// Turns queued transactions, and resend requests from the mine stage, into broadcasts.
pub struct SendHandler<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    pub chain_service: Arc<CS>,
    pub services: RelayServices,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl<CS> SendHandler<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    pub fn new(chain_service: Arc<CS>, services: RelayServices) -> Self {
        Self {
            chain_service,
            services,
            max_attempts: 10,
            retry_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retry_config(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// Requeues with `delay` while the attempt budget lasts, fails afterwards.
    fn retry<T>(
        &self,
        job: &BorrowedJob<SendJobData>,
        error: SendError,
        delay: Option<Duration>,
    ) -> JobResult<T, SendError> {
        if job.job.attempts >= self.max_attempts {
            tracing::error!(attempts = job.job.attempts, error = %error, "Send attempts exhausted");
            return Err(JobError::Fail(error));
        }
        Err(JobError::Nack {
            error,
            delay: Some(delay.unwrap_or(self.retry_delay)),
            position: RequeuePosition::Last,
        })
    }

    async fn send_user_operation(
        &self,
        job: &BorrowedJob<SendJobData>,
        chain: &impl Chain,
        record: TransactionRecord,
    ) -> JobResult<SendOutcome, SendError> {
        let Some(request) = record.user_operation.clone() else {
            return Err(JobError::Fail(SendError::InvalidTransaction {
                message: "User operation record has no user operation".to_string(),
            }));
        };

        let block = match chain.block_number().await {
            Ok(block) => block,
            Err(e) => return self.retry(job, chain_error(record.chain_id)(e), None),
        };

        let user_op_hash = match record.user_op_hash {
            Some(hash) => hash,
            None => match chain
                .send_user_operation(&request.user_operation, request.entrypoint)
                .await
            {
                Ok(hash) => hash,
                Err(e) => return self.retry(job, chain_error(record.chain_id)(e), None),
            },
        };

        tracing::info!(user_op_hash = %user_op_hash, "User operation submitted to bundler");

        let now = Utc::now();
        let updated = update_with(self.services.store.as_ref(), record, |r| {
            if eligibility(r, 0) != Eligibility::Send {
                return false;
            }
            r.status = TransactionStatus::Sent;
            r.user_op_hash = Some(user_op_hash);
            r.sent_at = Some(now);
            r.sent_at_block = Some(block);
            true
        })
        .await;

        self.after_update(job, updated, user_op_hash, None, true)
            .await
    }

    async fn send_first(
        &self,
        job: &BorrowedJob<SendJobData>,
        chain: &impl Chain,
        record: TransactionRecord,
    ) -> JobResult<SendOutcome, SendError> {
        let block = match chain.block_number().await {
            Ok(block) => block,
            Err(e) => return self.retry(job, chain_error(record.chain_id)(e), None),
        };

        let claim = match self.claim_nonce(chain, record).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                return Ok(SendOutcome::Skipped {
                    reason: "record changed before broadcast".to_string(),
                });
            }
            Err(e) => return self.retry(job, e, None),
        };
        let NonceClaim {
            record,
            nonce,
            gas,
            inherited,
        } = claim;

        let signed = match self.sign(&record, nonce, gas.gas_limit, gas.into()).await {
            Ok(signed) => signed,
            Err(e) => {
                // an inherited claim may already carry an earlier delivery's broadcast
                if !inherited {
                    self.release_claim(chain, &record, nonce, &release_only())
                        .await;
                }
                return Err(JobError::Fail(e));
            }
        };

        if let Err(e) = chain.send_raw_transaction(&signed.raw).await {
            let classified = BroadcastErrorClassifier::classify(&e);
            let strategy = BroadcastErrorClassifier::recovery_strategy(classified.kind);
            // every delivery signs the same transaction at a claimed nonce, so an occupied
            // nonce there is most likely an earlier delivery's broadcast
            let occupied_by_earlier_delivery = inherited && strategy.discard_nonce;

            if !strategy.treat_as_sent && !occupied_by_earlier_delivery {
                tracing::warn!(
                    nonce,
                    kind = ?classified.kind,
                    error = classified.message,
                    "Broadcast rejected"
                );
                self.release_claim(chain, &record, nonce, &strategy).await;
                let error = SendError::BroadcastRejected {
                    kind: classified.kind,
                    message: classified.message,
                };
                return self.retry(job, error, Some(strategy.retry_delay));
            }

            tracing::warn!(
                nonce,
                transaction_hash = %signed.hash,
                kind = ?classified.kind,
                "Broadcast outcome unclear, treating as sent"
            );
        }

        tracing::info!(nonce, transaction_hash = %signed.hash, "Transaction broadcast");

        let broadcast = Broadcast {
            hash: signed.hash,
            nonce,
            block,
            gas,
        };
        self.record_broadcast(job, record, broadcast).await
    }

    /// Gas limit and fees for a first broadcast. Only read-only chain calls.
    async fn first_send_gas(
        &self,
        chain: &impl Chain,
        record: &TransactionRecord,
    ) -> Result<GasParams, SendError> {
        let to_chain_error = chain_error(record.chain_id);
        let fees = first_send_fees(record, chain.estimate_fees().await.map_err(&to_chain_error)?);
        let gas_limit = match record.gas {
            Some(gas) => gas,
            None => chain
                .estimate_gas(&record.to_rpc_request())
                .await
                .map_err(&to_chain_error)?,
        };
        Ok(GasParams {
            gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        })
    }

    /// Pins a nonce and its gas on the still-queued record before anything is signed.
    ///
    /// Every later delivery of the same job finds the claim and signs the identical
    /// transaction, so duplicates collapse into one broadcast at one nonce. Returns `None` if
    /// the record left `queued` first.
    async fn claim_nonce(
        &self,
        chain: &impl Chain,
        record: TransactionRecord,
    ) -> Result<Option<NonceClaim>, SendError> {
        if let Some(nonce) = record.assigned_nonce() {
            return self.adopt_claim(chain, record, nonce).await.map(Some);
        }

        let gas = self.first_send_gas(chain, &record).await?;
        let nonce = self.allocate_nonce(chain, record.from).await?;
        tracing::debug!(nonce, "Allocated nonce");

        let claimed = update_with(self.services.store.as_ref(), record.clone(), |r| {
            if r.status != TransactionStatus::Queued || r.assigned_nonce().is_some() {
                return false;
            }
            r.nonce = Some(nonce as i64);
            r.sent_gas = Some(gas);
            true
        })
        .await?;

        if let Some(record) = claimed {
            return Ok(Some(NonceClaim {
                record,
                nonce,
                gas,
                inherited: false,
            }));
        }

        // another delivery or a cancellation got there first; nothing was signed at this nonce
        self.apply_recovery(chain, &record, nonce, &release_only())
            .await;

        let current = self
            .services
            .store
            .get(&record.queue_id)
            .await?
            .ok_or_else(|| SendError::TransactionNotFound {
                queue_id: record.queue_id.clone(),
            })?;

        match current.assigned_nonce() {
            Some(claimed) if current.status == TransactionStatus::Queued => {
                tracing::debug!(nonce = claimed, "Nonce claimed by another delivery, reusing it");
                self.adopt_claim(chain, current, claimed).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn adopt_claim(
        &self,
        chain: &impl Chain,
        record: TransactionRecord,
        nonce: u64,
    ) -> Result<NonceClaim, SendError> {
        // idempotent; the claimer marked it already
        self.services
            .ledger
            .mark_in_flight(record.chain_id, record.from, nonce)
            .await
            .map_err(|e| SendError::NonceLedgerError {
                message: e.to_string(),
            })?;

        let gas = match record.sent_gas {
            Some(gas) => gas,
            None => self.first_send_gas(chain, &record).await?,
        };
        Ok(NonceClaim {
            record,
            nonce,
            gas,
            inherited: true,
        })
    }

    /// Drops the claim on the record, then returns the nonce to the ledger per `strategy`.
    ///
    /// If the record moved on meanwhile, the nonce belongs to whatever moved it and the ledger
    /// is left alone.
    async fn release_claim(
        &self,
        chain: &impl Chain,
        record: &TransactionRecord,
        nonce: u64,
        strategy: &RecoveryStrategy,
    ) {
        if strategy.release_nonce || strategy.discard_nonce {
            let released = update_with(self.services.store.as_ref(), record.clone(), |r| {
                if r.status != TransactionStatus::Queued || r.assigned_nonce() != Some(nonce) {
                    return false;
                }
                r.nonce = None;
                r.sent_gas = None;
                true
            })
            .await;

            match released {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(nonce, "Record moved on, leaving its nonce alone");
                    return;
                }
                Err(e) => {
                    tracing::error!(nonce, error = %e, "Failed to release claimed nonce");
                    return;
                }
            }
        }

        self.apply_recovery(chain, record, nonce, strategy).await;
    }

    async fn resend(
        &self,
        job: &BorrowedJob<SendJobData>,
        chain: &impl Chain,
        record: TransactionRecord,
    ) -> JobResult<SendOutcome, SendError> {
        let resend_count = job.job.data.resend_count;
        let to_chain_error = chain_error(record.chain_id);

        let Some(nonce) = record.assigned_nonce() else {
            return Err(JobError::Fail(SendError::InvalidTransaction {
                message: "Sent transaction has no nonce".to_string(),
            }));
        };

        // idempotent; keeps the nonce tracked even if the ledger was reconciled by hand
        if let Err(e) = self
            .services
            .ledger
            .mark_in_flight(record.chain_id, record.from, nonce)
            .await
        {
            let error = SendError::NonceLedgerError {
                message: e.to_string(),
            };
            return self.retry(job, error, None);
        }

        let block = match chain.block_number().await {
            Ok(block) => block,
            Err(e) => return self.retry(job, to_chain_error(e), None),
        };
        let fees = match chain.estimate_fees().await {
            Ok(network) => resend_fees(&record, network, resend_count),
            Err(e) => return self.retry(job, to_chain_error(e), None),
        };
        let gas_limit = match record.sent_gas.map(|gas| gas.gas_limit).or(record.gas) {
            Some(gas) => gas,
            None => match chain.estimate_gas(&record.to_rpc_request()).await {
                Ok(gas) => gas,
                Err(e) => return self.retry(job, to_chain_error(e), None),
            },
        };

        let signed = match self.sign(&record, nonce, gas_limit, fees).await {
            Ok(signed) => signed,
            Err(e) => return self.retry(job, e, None),
        };

        if let Err(e) = chain.send_raw_transaction(&signed.raw).await {
            let classified = BroadcastErrorClassifier::classify(&e);
            match classified.kind {
                // an earlier broadcast at this nonce was included; the mine stage will see it
                BroadcastErrorKind::NonceTooLow => {
                    tracing::info!(nonce, "Nonce already consumed, skipping resend");
                    return Ok(SendOutcome::Skipped {
                        reason: "nonce already consumed".to_string(),
                    });
                }
                kind if BroadcastErrorClassifier::recovery_strategy(kind).treat_as_sent => {
                    tracing::warn!(nonce, kind = ?kind, "Resend outcome unclear, treating as sent");
                }
                kind => {
                    tracing::warn!(nonce, kind = ?kind, error = classified.message, "Resend rejected");
                    let delay = BroadcastErrorClassifier::recovery_strategy(kind).retry_delay;
                    let error = SendError::BroadcastRejected {
                        kind,
                        message: classified.message,
                    };
                    return self.retry(job, error, Some(delay));
                }
            }
        }

        tracing::info!(nonce, resend_count, transaction_hash = %signed.hash, "Transaction resent");

        let broadcast = Broadcast {
            hash: signed.hash,
            nonce,
            block,
            gas: GasParams {
                gas_limit,
                max_fee_per_gas: fees.max_fee_per_gas,
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            },
        };
        self.record_broadcast(job, record, broadcast).await
    }

    /// Allocates, seeding the ledger from the chain the first time a wallet is seen.
    async fn allocate_nonce(&self, chain: &impl Chain, from: Address) -> Result<u64, SendError> {
        let ledger = &self.services.ledger;
        let chain_id = chain.chain_id();
        let ledger_error = |e: NonceLedgerError| SendError::NonceLedgerError {
            message: e.to_string(),
        };

        match ledger.allocate(chain_id, from).await {
            Ok(nonce) => Ok(nonce),
            Err(NonceLedgerError::NeedsSync { .. }) => {
                let onchain = chain
                    .pending_transaction_count(from)
                    .await
                    .map_err(chain_error(chain_id))?;
                let next = ledger.sync(chain_id, from, onchain).await.map_err(ledger_error)?;
                tracing::info!(address = %from, next_nonce = next, "Synced nonce ledger from chain");
                ledger.allocate(chain_id, from).await.map_err(ledger_error)
            }
            Err(e) => Err(ledger_error(e)),
        }
    }

    async fn sign(
        &self,
        record: &TransactionRecord,
        nonce: u64,
        gas_limit: u64,
        fees: FeeChoice,
    ) -> Result<relay_core::signer::SignedTransaction, SendError> {
        let tx = build_transaction(record.to_rpc_request(), nonce, gas_limit, fees).map_err(|e| {
            SendError::InvalidTransaction {
                message: e.to_string(),
            }
        })?;
        self.services
            .signer
            .sign_transaction(record.from, tx)
            .await
            .map_err(|e| SendError::SigningFailed {
                message: e.to_string(),
            })
    }

    /// Ledger side of a failed first broadcast.
    async fn apply_recovery(
        &self,
        chain: &impl Chain,
        record: &TransactionRecord,
        nonce: u64,
        strategy: &RecoveryStrategy,
    ) {
        let ledger = &self.services.ledger;
        let (chain_id, from) = (record.chain_id, record.from);

        if strategy.release_nonce || strategy.discard_nonce {
            if let Err(e) = ledger.remove_from_in_flight(chain_id, from, nonce).await {
                tracing::error!(nonce, error = %e, "Failed to remove nonce from in-flight set");
                return;
            }
        }
        if strategy.release_nonce {
            if let Err(e) = ledger.recycle(chain_id, from, nonce).await {
                tracing::error!(nonce, error = %e, "Failed to recycle nonce");
            }
        }
        if strategy.needs_resync {
            match chain.pending_transaction_count(from).await {
                Ok(onchain) => {
                    if let Err(e) = ledger.sync(chain_id, from, onchain).await {
                        tracing::warn!(error = %e, "Failed to resync nonce ledger");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to read pending nonce for resync"),
            }
        }
    }

    async fn record_broadcast(
        &self,
        job: &BorrowedJob<SendJobData>,
        record: TransactionRecord,
        broadcast: Broadcast,
    ) -> JobResult<SendOutcome, SendError> {
        let resend_count = job.job.data.resend_count;
        let now = Utc::now();
        let mut entered_sent = false;
        let updated = update_with(self.services.store.as_ref(), record, |r| {
            let nonce = r.assigned_nonce();
            match eligibility(r, resend_count) {
                Eligibility::Send if nonce.is_none_or(|n| n == broadcast.nonce) => {
                    entered_sent = true;
                    r.status = TransactionStatus::Sent;
                    r.nonce = Some(broadcast.nonce as i64);
                    r.sent_transaction_hashes.push(broadcast.hash);
                    r.sent_at = Some(now);
                    r.sent_at_block = Some(broadcast.block);
                    r.resend_count = resend_count;
                    r.sent_gas = Some(broadcast.gas);
                    r.error_message = None;
                    true
                }
                // a concurrent delivery recorded first; keep our hash tracked too
                Eligibility::AlreadySent
                    if nonce == Some(broadcast.nonce)
                        && !r.sent_transaction_hashes.contains(&broadcast.hash) =>
                {
                    entered_sent = false;
                    r.sent_transaction_hashes.push(broadcast.hash);
                    true
                }
                _ => false,
            }
        })
        .await;

        self.after_update(job, updated, broadcast.hash, Some(broadcast.nonce), entered_sent)
            .await
    }

    async fn after_update(
        &self,
        job: &BorrowedJob<SendJobData>,
        updated: Result<Option<TransactionRecord>, crate::store::StoreError>,
        hash: B256,
        nonce: Option<u64>,
        entered_sent: bool,
    ) -> JobResult<SendOutcome, SendError> {
        let record = match updated {
            Ok(Some(record)) => record,
            Ok(None) => {
                // cancelled or finalized while we were broadcasting; the nonce stays in flight
                tracing::warn!(
                    nonce = ?nonce,
                    transaction_hash = %hash,
                    "Record moved on during broadcast, dropping result"
                );
                return Ok(SendOutcome::Skipped {
                    reason: "record changed during broadcast".to_string(),
                });
            }
            Err(e) => {
                // the claim survives on the record, so the retry rebroadcasts the same transaction
                tracing::error!(
                    nonce = ?nonce,
                    transaction_hash = %hash,
                    error = %e,
                    "Broadcast succeeded but the record update failed"
                );
                let error = SendError::RecordUpdateFailed {
                    transaction_hash: hash,
                    nonce,
                    message: e.to_string(),
                };
                return self.retry(job, error, None);
            }
        };

        if entered_sent {
            self.services.notifier.notify(&record);
        }

        if let Err(e) = self.enqueue_mine(&record.queue_id).await {
            // redelivery finds the record already sent and only re-enqueues the mine job
            return self.retry(job, e, None);
        }

        Ok(SendOutcome::Sent {
            hash,
            nonce,
            resend_count: record.resend_count,
        })
    }

    async fn enqueue_mine(&self, queue_id: &str) -> Result<(), SendError> {
        self.services
            .jobs
            .enqueue_mine(MineJobData {
                queue_id: queue_id.to_string(),
            })
            .await
            .map_err(|e| SendError::InternalError {
                message: format!("Failed to enqueue mine job: {e}"),
            })
    }
}

fn release_only() -> RecoveryStrategy {
    RecoveryStrategy {
        treat_as_sent: false,
        release_nonce: true,
        discard_nonce: false,
        needs_resync: false,
        retry_delay: Duration::ZERO,
    }
}

impl<CS> DurableExecution for SendHandler<CS>
where
    CS: ChainService + Send + Sync + 'static,
{
    type Output = SendOutcome;
    type ErrorData = SendError;
    type JobData = SendJobData;

    #[tracing::instrument(skip_all, fields(
        queue_id = job.job.data.queue_id,
        resend_count = job.job.data.resend_count,
        stage = "send",
        executor = "relay"
    ))]
    async fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> JobResult<Self::Output, Self::ErrorData> {
        let data = &job.job.data;

        let record = match self.services.store.get(&data.queue_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(JobError::Fail(SendError::TransactionNotFound {
                    queue_id: data.queue_id.clone(),
                }));
            }
            Err(e) => return self.retry(job, e.into(), None),
        };

        match eligibility(&record, data.resend_count) {
            Eligibility::Send => {}
            Eligibility::AlreadySent => {
                tracing::debug!("Already sent by an earlier delivery, ensuring mine job exists");
                if let Err(e) = self.enqueue_mine(&record.queue_id).await {
                    return self.retry(job, e, None);
                }
                return Ok(SendOutcome::Skipped {
                    reason: "already sent".to_string(),
                });
            }
            Eligibility::Stale => {
                tracing::debug!(
                    status = %record.status,
                    record_resend_count = record.resend_count,
                    "Send job no longer applies"
                );
                return Ok(SendOutcome::Skipped {
                    reason: format!("transaction is {}", record.status),
                });
            }
        }

        let chain = self
            .chain_service
            .get_chain(record.chain_id)
            .map_err(|e| {
                JobError::Fail(SendError::ChainError {
                    chain_id: record.chain_id,
                    message: format!("Failed to get chain instance: {e}"),
                })
            })?;

        if record.is_user_op {
            self.send_user_operation(job, &chain, record).await
        } else if data.resend_count == 0 {
            self.send_first(job, &chain, record).await
        } else {
            self.resend(job, &chain, record).await
        }
    }

    async fn on_success(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: SuccessHookData<'_, Self::Output>,
        _tx: &mut TransactionContext<'_>,
    ) {
        tracing::debug!(job_id = job.job.id, outcome = ?d.result, "Send job completed");
    }

    async fn on_nack(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: NackHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) {
        tracing::warn!(
            job_id = job.job.id,
            attempt = job.job.attempts,
            delay_ms = d.delay.map_or(0, |delay| delay.as_millis()),
            error = %d.error,
            "Send job requeued"
        );
    }

    async fn on_fail(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: FailHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) {
        if matches!(d.error, SendError::UserCancelled) {
            tracing::debug!(job_id = job.job.id, "Send job removed by cancellation");
            return;
        }

        tracing::error!(
            job_id = job.job.id,
            attempt = job.job.attempts,
            error = %d.error,
            "Send job failed"
        );

        // resends are finalized by the mine stage; a failed first send stays queued
        if job.job.data.resend_count != 0 {
            return;
        }

        let record = match self.services.store.get(&job.job.data.queue_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load record after send failure");
                return;
            }
        };

        let message = d.error.to_string();
        let result = update_with(self.services.store.as_ref(), record, |r| {
            if r.status != TransactionStatus::Queued {
                return false;
            }
            r.error_message = Some(message.clone());
            true
        })
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to record send failure");
        }
    }
}

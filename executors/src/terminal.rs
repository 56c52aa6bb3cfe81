use std::time::Duration;

use chrono::Utc;
use relay_core::{
    error::EngineError,
    transaction::{TransactionRecord, TransactionStatus},
};

use crate::{
    RelayServices, nonce_ledger::NonceLedgerError, store::update_with, usage::UsageEvent,
};

pub const TIMED_OUT_MESSAGE: &str = "Transaction timed out.";

const LEDGER_ATTEMPTS: u32 = 3;
const LEDGER_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Errored(Box<TransactionRecord>),
    /// The record had already left `sent`; nothing was changed.
    Skipped { status: Option<TransactionStatus> },
}

/// Finalizes a sent transaction whose confirmation polling ran out of attempts.
///
/// This is the only path that returns a nonce to circulation after a failed send.
#[derive(Clone)]
pub struct TerminalFailureHandler {
    services: RelayServices,
}

impl TerminalFailureHandler {
    pub fn new(services: RelayServices) -> Self {
        Self { services }
    }

    #[tracing::instrument(skip_all, fields(queue_id = queue_id, stage = "terminal"))]
    pub async fn handle(&self, queue_id: &str) -> Result<TerminalOutcome, EngineError> {
        let Some(record) = self.services.store.get(queue_id).await? else {
            tracing::warn!("No record to finalize");
            return Ok(TerminalOutcome::Skipped { status: None });
        };
        let status = record.status;

        let now = Utc::now();
        let updated = update_with(self.services.store.as_ref(), record, |r| {
            if r.status != TransactionStatus::Sent {
                return false;
            }
            r.status = TransactionStatus::Errored;
            r.error_message = Some(TIMED_OUT_MESSAGE.to_string());
            true
        })
        .await?;

        let Some(record) = updated else {
            tracing::debug!(status = %status, "Record no longer sent, leaving it alone");
            return Ok(TerminalOutcome::Skipped {
                status: Some(status),
            });
        };

        tracing::warn!(nonce = ?record.nonce, "Transaction timed out");

        self.services.notifier.notify(&record);
        self.services
            .usage
            .report(UsageEvent::errored(&record, now, TIMED_OUT_MESSAGE));

        if let (false, Some(nonce)) = (record.is_user_op, record.assigned_nonce()) {
            if let Err(e) = self.release_nonce(&record, nonce).await {
                tracing::error!(
                    nonce,
                    error = %e,
                    "Failed to return timed out nonce, it needs manual reconciliation"
                );
                return Err(e.into());
            }
        }

        Ok(TerminalOutcome::Errored(Box::new(record)))
    }

    /// Leaves in-flight before becoming recyclable, so a concurrent allocation that picks the
    /// nonce up again is never undone by our removal.
    ///
    /// The record is already errored and nothing runs this again, so ledger writes are retried.
    async fn release_nonce(
        &self,
        record: &TransactionRecord,
        nonce: u64,
    ) -> Result<(), NonceLedgerError> {
        let ledger = &self.services.ledger;
        let (chain_id, from) = (record.chain_id, record.from);

        with_retries(nonce, || ledger.remove_from_in_flight(chain_id, from, nonce)).await?;
        with_retries(nonce, || ledger.recycle(chain_id, from, nonce)).await
    }
}

async fn with_retries<T, F, Fut>(nonce: u64, mut op: F) -> Result<T, NonceLedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NonceLedgerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < LEDGER_ATTEMPTS => {
                tracing::warn!(nonce, attempt, error = %e, "Nonce ledger write failed, retrying");
                tokio::time::sleep(LEDGER_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

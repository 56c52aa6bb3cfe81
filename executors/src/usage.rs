use chrono::{DateTime, Utc};
use relay_core::transaction::TransactionRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    MineTx,
    CancelTx,
    ErrorTx,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInput {
    #[serde(flatten)]
    pub transaction: TransactionRecord,
    pub ms_since_queue: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ms_since_send: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub action: UsageAction,
    pub input: UsageInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UsageEvent {
    fn new(action: UsageAction, record: &TransactionRecord, now: DateTime<Utc>) -> Self {
        Self {
            action,
            input: UsageInput {
                transaction: record.clone(),
                ms_since_queue: record.ms_since_queued(now),
                ms_since_send: record.ms_since_sent(now),
            },
            error: None,
        }
    }

    pub fn mined(record: &TransactionRecord, now: DateTime<Utc>) -> Self {
        Self::new(UsageAction::MineTx, record, now)
    }

    pub fn cancelled(record: &TransactionRecord, now: DateTime<Utc>) -> Self {
        Self::new(UsageAction::CancelTx, record, now)
    }

    pub fn errored(record: &TransactionRecord, now: DateTime<Utc>, error: impl Into<String>) -> Self {
        let mut event = Self::new(UsageAction::ErrorTx, record, now);
        event.input.ms_since_send = None;
        event.error = Some(error.into());
        event
    }
}

/// Fire-and-forget sink for billing and analytics events.
pub trait UsageReporter: Send + Sync {
    fn report(&self, event: UsageEvent);
}

/// Drops every event. Used when no endpoint is configured.
pub struct NoopUsageReporter;

impl UsageReporter for NoopUsageReporter {
    fn report(&self, event: UsageEvent) {
        tracing::trace!(action = ?event.action, queue_id = event.input.transaction.queue_id, "Usage reporting disabled");
    }
}

pub struct HttpUsageReporter {
    client: reqwest::Client,
    url: String,
}

impl HttpUsageReporter {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl UsageReporter for HttpUsageReporter {
    fn report(&self, event: UsageEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&event)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            if let Err(e) = result {
                tracing::warn!(
                    action = ?event.action,
                    queue_id = event.input.transaction.queue_id,
                    error = %e,
                    "Failed to report usage"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use relay_core::transaction::SubmitTransactionRequest;

    #[test]
    fn error_events_carry_the_reason() {
        let queued_at = Utc::now();
        let record = TransactionRecord::queued(
            "usage-1".to_string(),
            SubmitTransactionRequest {
                chain_id: 1,
                from: Address::ZERO,
                to: None,
                data: Default::default(),
                value: Default::default(),
                gas: None,
                max_fee_per_gas: None,
                max_priority_fee_per_gas: None,
                user_operation: None,
                idempotency_key: None,
            },
            queued_at,
        );

        let event = UsageEvent::errored(
            &record,
            queued_at + chrono::Duration::milliseconds(1500),
            "Transaction timed out.",
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["action"], "error_tx");
        assert_eq!(json["error"], "Transaction timed out.");
        assert_eq!(json["input"]["queueId"], "usage-1");
        assert_eq!(json["input"]["msSinceQueue"], 1500);
        assert!(json["input"].get("msSinceSend").is_none());
    }
}

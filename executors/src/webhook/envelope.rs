use std::time::{SystemTime, UNIX_EPOCH};

use relay_core::transaction::{TransactionRecord, TransactionStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of every transaction status webhook.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransactionNotificationEnvelope {
    pub notification_id: String,
    pub queue_id: String,
    pub status: TransactionStatus,
    /// Unix seconds.
    pub timestamp: u64,
    pub transaction: TransactionRecord,
}

impl TransactionNotificationEnvelope {
    pub fn new(record: &TransactionRecord) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            queue_id: record.queue_id.clone(),
            status: record.status,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            transaction: record.clone(),
        }
    }
}

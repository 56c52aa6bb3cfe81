use std::sync::Arc;

use relay_core::transaction::TransactionRecord;
use relay_queue::queue::QueueHandle;
use serde::Deserialize;

use super::{WebhookJobPayload, envelope::TransactionNotificationEnvelope};

/// Informed of every transition into `sent`, `mined`, `errored` or `cancelled`.
///
/// Implementations must not block: the pipeline never waits for delivery.
pub trait TransactionNotifier: Send + Sync {
    fn notify(&self, record: &TransactionRecord);
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    #[serde(default)]
    pub hmac_secret: Option<String>,
}

/// Fans each notification out as one webhook job per configured target.
pub struct WebhookNotifier {
    queue: QueueHandle<WebhookJobPayload>,
    targets: Arc<Vec<WebhookTarget>>,
}

impl WebhookNotifier {
    pub fn new(queue: QueueHandle<WebhookJobPayload>, targets: Vec<WebhookTarget>) -> Self {
        Self {
            queue,
            targets: Arc::new(targets),
        }
    }
}

impl TransactionNotifier for WebhookNotifier {
    fn notify(&self, record: &TransactionRecord) {
        if self.targets.is_empty() {
            return;
        }

        let envelope = TransactionNotificationEnvelope::new(record);
        let body = match serde_json::to_string(&envelope) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(queue_id = record.queue_id, error = %e, "Failed to serialize webhook envelope");
                return;
            }
        };

        let queue = self.queue.clone();
        let targets = self.targets.clone();
        tokio::spawn(async move {
            for (index, target) in targets.iter().enumerate() {
                let payload = WebhookJobPayload {
                    url: target.url.clone(),
                    body: body.clone(),
                    headers: None,
                    hmac_secret: target.hmac_secret.clone(),
                };
                let job_id = format!("{}:{index}", envelope.notification_id);
                if let Err(e) = queue.job(payload).with_id(job_id).push().await {
                    tracing::error!(
                        queue_id = envelope.queue_id,
                        url = target.url,
                        error = %e,
                        "Failed to queue webhook"
                    );
                }
            }
        });
    }
}

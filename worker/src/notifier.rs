use async_trait::async_trait;

use keel_cloud::{Notifier, ProgressEvent};
use keel_common::streams::subjects;

/// Publishes progress records to the per-cluster event subject.
/// Fire-and-forget: a failed publish never fails the operation.
pub struct NatsNotifier {
    client: async_nats::Client,
}

impl NatsNotifier {
    pub fn new(client: async_nats::Client) -> NatsNotifier {
        NatsNotifier { client }
    }
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn publish(&self, event: &ProgressEvent) {
        let subject = subjects::cluster_events(&event.cluster_id);
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize progress event");
                return;
            }
        };
        if let Err(e) = self.client.publish(subject, payload.into()).await {
            tracing::warn!(cluster = %event.cluster_id, error = %e, "failed to publish progress event");
        }
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Free-form progress record published per cluster so external UIs can
/// follow along. Best-effort; losing one is fine.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub cluster_id: String,
    pub phase: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &ProgressEvent);
}

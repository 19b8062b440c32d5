/// JetStream stream holding cluster operation messages.
pub const OPS_STREAM: &str = "KEEL_OPS";

/// Durable consumer / queue group shared by all workers.
pub const WORKER_QUEUE: &str = "cluster-api-workers";

pub mod subjects {
    use std::fmt::Display;

    /// Cluster operations are dispatched on this subject.
    pub const CREATE_CLUSTER: &str = "create-cluster";

    /// Per-cluster progress events, consumed by UIs.
    pub fn cluster_events<T>(cluster_id: T) -> String
    where
        T: Display,
    {
        format!("cluster.{}.events", cluster_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_subject_embeds_cluster_id() {
        assert_eq!(subjects::cluster_events("do-1"), "cluster.do-1.events");
    }
}

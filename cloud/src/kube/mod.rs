//! The only components allowed to talk to a provisioned control plane:
//! a narrow admin client (nodes, secrets) and the bootstrap client that
//! pushes cluster-api objects. Everything else goes through these
//! traits, so the engine never sees a raw Kubernetes client.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use keel_common::wait::{RETRY_INTERVAL, RETRY_TIMEOUT, poll_until};
use keel_types::{Cluster, MachineSet};

use crate::CloudError;
use crate::pki::ClusterPki;

mod client;
pub mod convert;

pub use client::DefaultKubeConnector;

/// Node facts the reconciler routes on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeStatus {
    pub name: String,
    pub is_master: bool,
    pub ready: bool,
    /// e.g. `v1.13.4`
    pub kubelet_version: String,
    pub provider_id: String,
    /// Tainted `node.cloudprovider.kubernetes.io/uninitialized`.
    pub uninitialized: bool,
}

#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>, CloudError>;

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), CloudError>;
}

#[async_trait]
pub trait BootstrapClient: Send + Sync {
    /// Creates or updates one object given as plain JSON.
    async fn apply(&self, object: Value) -> Result<(), CloudError>;

    /// Deletes one object; already-gone is not an error.
    async fn delete(&self, object: Value) -> Result<(), CloudError>;

    async fn create_machine_sets(
        &self,
        sets: &[MachineSet],
        namespace: &str,
    ) -> Result<(), CloudError>;

    async fn get_machine_sets(&self) -> Result<Vec<MachineSet>, CloudError>;

    fn context_namespace(&self) -> String;
}

/// Builds clients for a given cluster. Swapped out in tests.
#[async_trait]
pub trait KubeConnector: Send + Sync {
    async fn admin(
        &self,
        cluster: &Cluster,
        pki: &ClusterPki,
    ) -> Result<Arc<dyn AdminClient>, CloudError>;

    async fn bootstrap(
        &self,
        cluster: &Cluster,
        pki: &ClusterPki,
    ) -> Result<Arc<dyn BootstrapClient>, CloudError>;
}

/// Blocks until some control-plane node is Ready and initialized.
pub async fn wait_for_ready_master(admin: &dyn AdminClient) -> Result<(), CloudError> {
    tracing::info!("waiting for a ready master node");
    poll_until(RETRY_INTERVAL, RETRY_TIMEOUT, || async {
        let nodes = admin.list_nodes().await?;
        Ok(nodes
            .iter()
            .any(|n| n.is_master && n.ready && !n.uninitialized)
            .then_some(()))
    })
    .await
    .map_err(Into::into)
}

/// Blocks until the master kubelet reports `target` and is Ready again.
pub async fn wait_for_master_version(
    admin: &dyn AdminClient,
    target: &semver::Version,
) -> Result<(), CloudError> {
    tracing::info!(%target, "waiting for master to reach target version");
    poll_until(RETRY_INTERVAL, RETRY_TIMEOUT, || async {
        let nodes = admin.list_nodes().await?;
        let done = nodes.iter().any(|n| {
            n.is_master
                && n.ready
                && crate::plan::parse_kubelet_version(&n.kubelet_version)
                    .map(|v| v == *target)
                    .unwrap_or(false)
        });
        Ok(done.then_some(()))
    })
    .await
    .map_err(Into::into)
}

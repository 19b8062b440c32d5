use std::sync::Arc;

use keel_store::Store;
use keel_types::{Cluster, Credential, SshKey};

use crate::CloudError;
use crate::kube::{DefaultKubeConnector, KubeConnector};
use crate::notify::{Notifier, ProgressEvent};
use crate::pki::ClusterPki;

/// Ambient state threaded through the engine. Append-only: every
/// `with_*` returns a copy, so attaching a per-cluster notifier or
/// credential never mutates state visible to sibling operations.
#[derive(Clone)]
pub struct Context {
    store: Store,
    kube: Arc<dyn KubeConnector>,
    credential: Option<Arc<Credential>>,
    pki: Option<Arc<ClusterPki>>,
    ssh_key: Option<Arc<SshKey>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Context {
    pub fn new(store: Store) -> Context {
        Context {
            store,
            kube: Arc::new(DefaultKubeConnector),
            credential: None,
            pki: None,
            ssh_key: None,
            notifier: None,
        }
    }

    /// Swaps the Kubernetes connector; tests use this to avoid a real
    /// control plane.
    pub fn with_kube_connector(mut self, kube: Arc<dyn KubeConnector>) -> Context {
        self.kube = kube;
        self
    }

    pub fn with_owner(&self, owner: &str) -> Context {
        let mut ctx = self.clone();
        ctx.store = self.store.with_owner(owner);
        ctx
    }

    pub fn with_credential(&self, credential: Credential) -> Context {
        let mut ctx = self.clone();
        ctx.credential = Some(Arc::new(credential));
        ctx
    }

    pub fn with_pki(&self, pki: ClusterPki) -> Context {
        let mut ctx = self.clone();
        ctx.pki = Some(Arc::new(pki));
        ctx
    }

    pub fn with_ssh_key(&self, key: SshKey) -> Context {
        let mut ctx = self.clone();
        ctx.ssh_key = Some(Arc::new(key));
        ctx
    }

    pub fn with_notifier(&self, notifier: Arc<dyn Notifier>) -> Context {
        let mut ctx = self.clone();
        ctx.notifier = Some(notifier);
        ctx
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn kube(&self) -> &dyn KubeConnector {
        self.kube.as_ref()
    }

    pub fn credential(&self) -> Result<&Credential, CloudError> {
        self.credential
            .as_deref()
            .ok_or_else(|| CloudError::InvalidCredential {
                name: String::new(),
                reason: "no credential loaded into context".to_string(),
            })
    }

    pub fn pki(&self) -> Result<&ClusterPki, CloudError> {
        self.pki
            .as_deref()
            .ok_or_else(|| CloudError::Pki("no key material loaded into context".to_string()))
    }

    pub fn ssh_key(&self) -> Result<&SshKey, CloudError> {
        self.ssh_key
            .as_deref()
            .ok_or_else(|| CloudError::Pki("no ssh key loaded into context".to_string()))
    }

    /// Best-effort progress publication.
    pub async fn notify(&self, cluster: &Cluster, message: &str, error: Option<&str>) {
        if let Some(notifier) = &self.notifier {
            notifier
                .publish(&ProgressEvent {
                    cluster_id: cluster.name.clone(),
                    phase: cluster.status.phase.to_string(),
                    message: message.to_string(),
                    error: error.map(str::to_string),
                })
                .await;
        }
    }
}

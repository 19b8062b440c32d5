//! In-memory backend with vfs key layout and semantics. Not a
//! production backend; it exists so the engine's behavior is testable
//! without a bucket or a database.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use keel_types::{CertBundle, SshKey};

use crate::{Backend, Kind, Scope, StoreError, paths};

const PREFIX: &str = "mem";

#[derive(Default)]
pub struct MemBackend {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> MemBackend {
        MemBackend::default()
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    fn write(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    fn remove(&self, key: &str) -> bool {
        self.objects.lock().unwrap().remove(key).is_some()
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn get(&self, kind: Kind, scope: &Scope, name: &str) -> Result<Value, StoreError> {
        let key = paths::resource_key(PREFIX, kind, scope, name);
        match self.read(&key) {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::not_found(kind.as_str(), name)),
        }
    }

    async fn list(&self, kind: Kind, scope: &Scope) -> Result<Vec<Value>, StoreError> {
        let home = format!("{}/", paths::resource_home(PREFIX, kind, scope));
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .filter(|(key, _)| {
                key.starts_with(&home)
                    && key.ends_with(".json")
                    && !key[home.len()..].trim_end_matches(".json").contains('/')
            })
            .map(|(_, bytes)| Ok(serde_json::from_slice(bytes)?))
            .collect()
    }

    async fn create(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        value: Value,
    ) -> Result<Value, StoreError> {
        let key = paths::resource_key(PREFIX, kind, scope, name);
        if self.read(&key).is_some() {
            return Err(StoreError::already_exists(kind.as_str(), name));
        }
        self.write(&key, serde_json::to_vec(&value)?);
        Ok(value)
    }

    async fn update(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        value: Value,
    ) -> Result<Value, StoreError> {
        let key = paths::resource_key(PREFIX, kind, scope, name);
        if self.read(&key).is_none() {
            return Err(StoreError::not_found(kind.as_str(), name));
        }
        self.write(&key, serde_json::to_vec(&value)?);
        Ok(value)
    }

    async fn delete(&self, kind: Kind, scope: &Scope, name: &str) -> Result<(), StoreError> {
        let key = paths::resource_key(PREFIX, kind, scope, name);
        if !self.remove(&key) {
            return Err(StoreError::not_found(kind.as_str(), name));
        }
        Ok(())
    }

    async fn get_cert(&self, scope: &Scope, name: &str) -> Result<CertBundle, StoreError> {
        let (cert_key, key_key) = paths::cert_keys(PREFIX, scope, name);
        let (cert, key) = match (self.read(&cert_key), self.read(&key_key)) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Err(StoreError::not_found("certificate", name)),
        };
        Ok(CertBundle {
            cert_pem: String::from_utf8_lossy(&cert).into_owned(),
            key_pem: String::from_utf8_lossy(&key).into_owned(),
        })
    }

    async fn create_cert(
        &self,
        scope: &Scope,
        name: &str,
        bundle: &CertBundle,
    ) -> Result<(), StoreError> {
        let (cert_key, key_key) = paths::cert_keys(PREFIX, scope, name);
        if self.read(&cert_key).is_some() {
            return Err(StoreError::already_exists("certificate", name));
        }
        self.write(&cert_key, bundle.cert_pem.clone().into_bytes());
        self.write(&key_key, bundle.key_pem.clone().into_bytes());
        Ok(())
    }

    async fn get_ssh_key(&self, scope: &Scope) -> Result<SshKey, StoreError> {
        let (private_key, public_key) = paths::ssh_keys(PREFIX, scope);
        let (private, public) = match (self.read(&private_key), self.read(&public_key)) {
            (Some(private), Some(public)) => (private, public),
            _ => return Err(StoreError::not_found("ssh key", scope.cluster())),
        };
        Ok(SshKey {
            private_key_pem: String::from_utf8_lossy(&private).into_owned(),
            public_key_openssh: String::from_utf8_lossy(&public).into_owned(),
            fingerprint: String::new(),
        })
    }

    async fn create_ssh_key(&self, scope: &Scope, key: &SshKey) -> Result<(), StoreError> {
        let (private_key, public_key) = paths::ssh_keys(PREFIX, scope);
        if self.read(&private_key).is_some() {
            return Err(StoreError::already_exists("ssh key", scope.cluster()));
        }
        self.write(&private_key, key.private_key_pem.clone().into_bytes());
        self.write(&public_key, key.public_key_openssh.clone().into_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use keel_types::{Cluster, ClusterPhase, Machine, Operation, OperationState};

    fn store() -> Store {
        Store::from_backend(MemBackend::new())
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        let cluster = Cluster {
            name: "do-1".into(),
            ..Default::default()
        };
        store.clusters().create(&cluster).await.unwrap();
        let loaded = store.clusters().get("do-1").await.unwrap();
        assert_eq!(loaded, cluster);
    }

    #[tokio::test]
    async fn create_conflicts_and_missing_updates_are_typed() {
        let store = store();
        let cluster = Cluster {
            name: "do-1".into(),
            ..Default::default()
        };
        store.clusters().create(&cluster).await.unwrap();
        let err = store.clusters().create(&cluster).await.unwrap_err();
        assert!(err.is_already_exists());

        let ghost = Cluster {
            name: "ghost".into(),
            ..Default::default()
        };
        let err = store.clusters().update(&ghost).await.unwrap_err();
        assert!(err.is_not_found());

        let err = store.clusters().get("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn owners_do_not_see_each_other() {
        let store = store();
        let cluster = Cluster {
            name: "do-1".into(),
            ..Default::default()
        };
        store
            .with_owner("alice")
            .clusters()
            .create(&cluster)
            .await
            .unwrap();
        assert!(
            store
                .with_owner("bob")
                .clusters()
                .get("do-1")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn cluster_listing_does_not_pick_up_machines() {
        let store = store();
        store
            .clusters()
            .create(&Cluster {
                name: "do-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .machines("do-1")
            .create(&Machine {
                name: "do-1-master".into(),
                cluster_name: "do-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let clusters = store.clusters().list().await.unwrap();
        assert_eq!(clusters.len(), 1);
        let machines = store.machines("do-1").list().await.unwrap();
        assert_eq!(machines.len(), 1);
    }

    #[tokio::test]
    async fn status_updates_persist() {
        let store = store();
        let mut cluster = Cluster {
            name: "do-1".into(),
            ..Default::default()
        };
        store.clusters().create(&cluster).await.unwrap();
        cluster.status.phase = ClusterPhase::Ready;
        store.clusters().update_status(&cluster).await.unwrap();
        let loaded = store.clusters().get("do-1").await.unwrap();
        assert_eq!(loaded.status.phase, ClusterPhase::Ready);
    }

    #[tokio::test]
    async fn operations_are_keyed_by_code() {
        let store = store();
        let op = Operation {
            code: "op-17".into(),
            user_id: "alice".into(),
            cluster_id: "do-1".into(),
            ..Default::default()
        };
        store.operations().create(&op).await.unwrap();
        let mut loaded = store.operations().get("op-17").await.unwrap();
        assert_eq!(loaded.state, OperationState::Pending);
        loaded.transition(OperationState::Running).unwrap();
        store.operations().update(&loaded).await.unwrap();
        assert_eq!(
            store.operations().get("op-17").await.unwrap().state,
            OperationState::Running
        );
    }
}

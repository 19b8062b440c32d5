//! Typed repositories for everything keel persists: clusters, machines,
//! machine sets, operations, credentials, SSH keys and CA material.
//!
//! Two interchangeable backends with identical semantics: an
//! object-store backend ("vfs", one JSON blob per resource) and a
//! relational backend (postgres, one table per kind). Missing objects
//! surface as [`StoreError::NotFound`], create conflicts as
//! [`StoreError::AlreadyExists`]; writes are last-writer-wins per key and
//! there are no cross-kind transactions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use keel_common::args::StoreArgs;
use keel_types::{CertBundle, Cluster, Credential, Machine, MachineSet, Operation, SshKey};

mod error;
#[cfg(any(test, feature = "mem"))]
pub mod mem;
pub mod paths;
mod postgres;
mod vfs;

pub use error::StoreError;
pub use postgres::PostgresBackend;
pub use vfs::VfsBackend;

pub const DEFAULT_OWNER: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Cluster,
    Machine,
    MachineSet,
    Operation,
    Credential,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Cluster => "cluster",
            Kind::Machine => "machine",
            Kind::MachineSet => "machine_set",
            Kind::Operation => "operation",
            Kind::Credential => "credential",
        }
    }
}

/// Two-level namespace a repository operates in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    pub owner: String,
    pub cluster: Option<String>,
}

impl Scope {
    pub fn cluster(&self) -> &str {
        self.cluster.as_deref().unwrap_or_default()
    }
}

/// What every backend implements. JSON values cross this seam so the
/// typed wrappers above it stay backend-agnostic.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, kind: Kind, scope: &Scope, name: &str) -> Result<Value, StoreError>;
    async fn list(&self, kind: Kind, scope: &Scope) -> Result<Vec<Value>, StoreError>;
    async fn create(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        value: Value,
    ) -> Result<Value, StoreError>;
    async fn update(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        value: Value,
    ) -> Result<Value, StoreError>;
    async fn delete(&self, kind: Kind, scope: &Scope, name: &str) -> Result<(), StoreError>;

    // Key material does not serialize to a single JSON blob under the
    // vfs layout, so it gets its own entry points.
    async fn get_cert(&self, scope: &Scope, name: &str) -> Result<CertBundle, StoreError>;
    async fn create_cert(
        &self,
        scope: &Scope,
        name: &str,
        bundle: &CertBundle,
    ) -> Result<(), StoreError>;
    async fn get_ssh_key(&self, scope: &Scope) -> Result<SshKey, StoreError>;
    async fn create_ssh_key(&self, scope: &Scope, key: &SshKey) -> Result<(), StoreError>;
}

/// Handle to the persistence layer, scoped to one owner.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    owner: String,
}

impl Store {
    /// Opens the backend selected by `--store`.
    pub async fn open(args: &StoreArgs) -> anyhow::Result<Store> {
        match args.store.as_str() {
            "vfs" => Ok(Store::from_backend(VfsBackend::connect(&args.vfs).await?)),
            "postgres" => Ok(Store::from_backend(
                PostgresBackend::connect(&args.postgres).await?,
            )),
            other => anyhow::bail!("unknown store backend `{other}` (expected vfs or postgres)"),
        }
    }

    pub fn from_backend(backend: impl Backend + 'static) -> Store {
        Store {
            backend: Arc::new(backend),
            owner: DEFAULT_OWNER.to_string(),
        }
    }

    /// Re-scopes the handle to another owner.
    pub fn with_owner(&self, owner: &str) -> Store {
        Store {
            backend: self.backend.clone(),
            owner: owner.to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn scope(&self, cluster: Option<&str>) -> Scope {
        Scope {
            owner: self.owner.clone(),
            cluster: cluster.map(str::to_string),
        }
    }

    pub fn clusters(&self) -> Clusters<'_> {
        Clusters { store: self }
    }

    pub fn machines(&self, cluster: &str) -> Machines<'_> {
        Machines {
            store: self,
            cluster: cluster.to_string(),
        }
    }

    pub fn machine_sets(&self, cluster: &str) -> MachineSets<'_> {
        MachineSets {
            store: self,
            cluster: cluster.to_string(),
        }
    }

    pub fn operations(&self) -> Operations<'_> {
        Operations { store: self }
    }

    pub fn credentials(&self) -> Credentials<'_> {
        Credentials { store: self }
    }

    pub fn ssh_keys(&self, cluster: &str) -> SshKeys<'_> {
        SshKeys {
            store: self,
            cluster: cluster.to_string(),
        }
    }

    pub fn certificates(&self, cluster: &str) -> Certificates<'_> {
        Certificates {
            store: self,
            cluster: cluster.to_string(),
        }
    }

    async fn get_typed<T: DeserializeOwned>(
        &self,
        kind: Kind,
        scope: Scope,
        name: &str,
    ) -> Result<T, StoreError> {
        let value = self.backend.get(kind, &scope, name).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_typed<T: DeserializeOwned>(
        &self,
        kind: Kind,
        scope: Scope,
    ) -> Result<Vec<T>, StoreError> {
        let values = self.backend.list(kind, &scope).await?;
        values
            .into_iter()
            .map(|v| Ok(serde_json::from_value(v)?))
            .collect()
    }

    async fn create_typed<T: Serialize + DeserializeOwned>(
        &self,
        kind: Kind,
        scope: Scope,
        name: &str,
        obj: &T,
    ) -> Result<T, StoreError> {
        let value = self
            .backend
            .create(kind, &scope, name, serde_json::to_value(obj)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn update_typed<T: Serialize + DeserializeOwned>(
        &self,
        kind: Kind,
        scope: Scope,
        name: &str,
        obj: &T,
    ) -> Result<T, StoreError> {
        let value = self
            .backend
            .update(kind, &scope, name, serde_json::to_value(obj)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

pub struct Clusters<'a> {
    store: &'a Store,
}

impl Clusters<'_> {
    pub async fn get(&self, name: &str) -> Result<Cluster, StoreError> {
        self.store
            .get_typed(Kind::Cluster, self.store.scope(None), name)
            .await
    }

    pub async fn list(&self) -> Result<Vec<Cluster>, StoreError> {
        self.store
            .list_typed(Kind::Cluster, self.store.scope(None))
            .await
    }

    pub async fn create(&self, cluster: &Cluster) -> Result<Cluster, StoreError> {
        self.store
            .create_typed(Kind::Cluster, self.store.scope(None), &cluster.name, cluster)
            .await
    }

    pub async fn update(&self, cluster: &Cluster) -> Result<Cluster, StoreError> {
        self.store
            .update_typed(Kind::Cluster, self.store.scope(None), &cluster.name, cluster)
            .await
    }

    /// Persists a status change. Blob backends write the whole object;
    /// the contract is last-writer-wins either way.
    pub async fn update_status(&self, cluster: &Cluster) -> Result<Cluster, StoreError> {
        self.update(cluster).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .backend
            .delete(Kind::Cluster, &self.store.scope(None), name)
            .await
    }
}

pub struct Machines<'a> {
    store: &'a Store,
    cluster: String,
}

impl Machines<'_> {
    fn scope(&self) -> Scope {
        self.store.scope(Some(&self.cluster))
    }

    pub async fn get(&self, name: &str) -> Result<Machine, StoreError> {
        self.store.get_typed(Kind::Machine, self.scope(), name).await
    }

    pub async fn list(&self) -> Result<Vec<Machine>, StoreError> {
        self.store.list_typed(Kind::Machine, self.scope()).await
    }

    pub async fn create(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.store
            .create_typed(Kind::Machine, self.scope(), &machine.name, machine)
            .await
    }

    pub async fn update(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.store
            .update_typed(Kind::Machine, self.scope(), &machine.name, machine)
            .await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .backend
            .delete(Kind::Machine, &self.scope(), name)
            .await
    }
}

pub struct MachineSets<'a> {
    store: &'a Store,
    cluster: String,
}

impl MachineSets<'_> {
    fn scope(&self) -> Scope {
        self.store.scope(Some(&self.cluster))
    }

    pub async fn get(&self, name: &str) -> Result<MachineSet, StoreError> {
        self.store
            .get_typed(Kind::MachineSet, self.scope(), name)
            .await
    }

    pub async fn list(&self) -> Result<Vec<MachineSet>, StoreError> {
        self.store.list_typed(Kind::MachineSet, self.scope()).await
    }

    pub async fn create(&self, set: &MachineSet) -> Result<MachineSet, StoreError> {
        self.store
            .create_typed(Kind::MachineSet, self.scope(), &set.name, set)
            .await
    }

    pub async fn update(&self, set: &MachineSet) -> Result<MachineSet, StoreError> {
        self.store
            .update_typed(Kind::MachineSet, self.scope(), &set.name, set)
            .await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .backend
            .delete(Kind::MachineSet, &self.scope(), name)
            .await
    }
}

/// Operations are looked up by their external code, not the storage id.
pub struct Operations<'a> {
    store: &'a Store,
}

impl Operations<'_> {
    pub async fn get(&self, code: &str) -> Result<Operation, StoreError> {
        self.store
            .get_typed(Kind::Operation, self.store.scope(None), code)
            .await
    }

    pub async fn create(&self, op: &Operation) -> Result<Operation, StoreError> {
        self.store
            .create_typed(Kind::Operation, self.store.scope(None), &op.code, op)
            .await
    }

    pub async fn update(&self, op: &Operation) -> Result<Operation, StoreError> {
        self.store
            .update_typed(Kind::Operation, self.store.scope(None), &op.code, op)
            .await
    }
}

pub struct Credentials<'a> {
    store: &'a Store,
}

impl Credentials<'_> {
    pub async fn get(&self, name: &str) -> Result<Credential, StoreError> {
        self.store
            .get_typed(Kind::Credential, self.store.scope(None), name)
            .await
    }

    pub async fn list(&self) -> Result<Vec<Credential>, StoreError> {
        self.store
            .list_typed(Kind::Credential, self.store.scope(None))
            .await
    }

    pub async fn create(&self, credential: &Credential) -> Result<Credential, StoreError> {
        self.store
            .create_typed(
                Kind::Credential,
                self.store.scope(None),
                &credential.name,
                credential,
            )
            .await
    }

    pub async fn update(&self, credential: &Credential) -> Result<Credential, StoreError> {
        self.store
            .update_typed(
                Kind::Credential,
                self.store.scope(None),
                &credential.name,
                credential,
            )
            .await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .backend
            .delete(Kind::Credential, &self.store.scope(None), name)
            .await
    }
}

pub struct SshKeys<'a> {
    store: &'a Store,
    cluster: String,
}

impl SshKeys<'_> {
    pub async fn get(&self) -> Result<SshKey, StoreError> {
        self.store
            .backend
            .get_ssh_key(&self.store.scope(Some(&self.cluster)))
            .await
    }

    pub async fn create(&self, key: &SshKey) -> Result<(), StoreError> {
        self.store
            .backend
            .create_ssh_key(&self.store.scope(Some(&self.cluster)), key)
            .await
    }
}

pub struct Certificates<'a> {
    store: &'a Store,
    cluster: String,
}

impl Certificates<'_> {
    pub async fn get(&self, name: &str) -> Result<CertBundle, StoreError> {
        self.store
            .backend
            .get_cert(&self.store.scope(Some(&self.cluster)), name)
            .await
    }

    pub async fn create(&self, name: &str, bundle: &CertBundle) -> Result<(), StoreError> {
        self.store
            .backend
            .create_cert(&self.store.scope(Some(&self.cluster)), name, bundle)
            .await
    }
}

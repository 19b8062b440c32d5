//! The reconciliation engine: provider registry, ambient context,
//! credential and key material services, Kubernetes seams, and the
//! per-provider cluster managers.

mod clusterapi;
mod context;
pub mod credential;
mod engine;
mod error;
pub mod kube;
pub mod kubeconfig;
pub mod manager;
mod notify;
mod ops;
pub mod pki;
pub mod plan;
pub mod providers;
pub mod registry;
pub mod sshkey;
pub mod startup;
#[cfg(test)]
pub mod testutil;

pub use clusterapi::install as install_cluster_api;
pub use context::Context;
pub use error::{CloudError, ignore_already_exists, ignore_not_found};
pub use manager::ClusterManager;
pub use notify::{Notifier, ProgressEvent};
pub use ops::{apply, create_cluster, prepare};

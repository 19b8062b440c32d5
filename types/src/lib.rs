mod action;
mod cluster;
mod credential;
mod keys;
mod machine;
mod node;
mod operation;

pub use action::*;
pub use cluster::*;
pub use credential::*;
pub use keys::*;
pub use machine::*;
pub use node::*;
pub use operation::*;

/// Secure port the API server binds and is fronted on.
pub const KUBERNETES_BIND_PORT: u16 = 6443;

/// Node label carried by control-plane nodes.
pub const ROLE_MASTER_LABEL: &str = "node-role.kubernetes.io/master";

/// Taint set by the cloud-controller-manager until it has seen the node.
pub const UNINITIALIZED_TAINT: &str = "node.cloudprovider.kubernetes.io/uninitialized";

/// Label copied from a MachineSet onto the Machines it stamps out.
pub const POOL_LABEL: &str = "cluster.keel.io/pool";

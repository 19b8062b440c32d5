use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{KUBERNETES_BIND_PORT, NodeAddress, NodeAddressKind, ProviderSpec};

/// Pod network CIDR handed out when the caller leaves it empty.
pub const CALICO_POD_CIDR: &str = "192.168.0.0/16";
pub const FLANNEL_POD_CIDR: &str = "10.244.0.0/16";
pub const CANAL_POD_CIDR: &str = "10.244.0.0/16";

pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";
pub const DEFAULT_SERVICE_DOMAIN: &str = "cluster.local";

/// The desired state of one managed cluster. Everything the reconciler
/// does is derived from this record plus its Machines and MachineSets.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Cluster {
    pub name: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    /// Non-null marks the cluster for teardown on the next apply, even
    /// while the phase is still `Ready`.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub spec: ClusterSpec,

    #[serde(default)]
    pub status: ClusterStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ClusterSpec {
    pub config: ClusterConfig,

    #[serde(default)]
    pub cluster_api: ClusterApi,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ClusterConfig {
    #[serde(default = "default_master_count")]
    pub master_count: u32,

    pub cloud: CloudSpec,

    pub kubernetes_version: String,

    pub credential_name: String,

    #[serde(default)]
    pub ca_cert_name: String,

    #[serde(default)]
    pub front_proxy_ca_cert_name: String,

    #[serde(default)]
    pub kubelet_extra_args: BTreeMap<String, String>,

    #[serde(default)]
    pub api_server_extra_args: BTreeMap<String, String>,

    #[serde(default)]
    pub controller_manager_extra_args: BTreeMap<String, String>,

    #[serde(default)]
    pub scheduler_extra_args: BTreeMap<String, String>,

    #[serde(default)]
    pub authorization_modes: Vec<String>,

    #[serde(default)]
    pub api_server_cert_sans: Vec<String>,
}

fn default_master_count() -> u32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct CloudSpec {
    pub cloud_provider: String,

    #[serde(default)]
    pub project: String,

    pub region: String,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub instance_image: String,

    #[serde(default)]
    pub os: String,

    #[serde(default)]
    pub instance_image_project: String,

    /// CNI in use: calico, flannel or canal.
    #[serde(default)]
    pub network_provider: String,

    #[serde(default)]
    pub ccm_credential_name: String,

    #[serde(default)]
    pub ssh_key_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gce: Option<GoogleSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct GoogleSpec {
    #[serde(default)]
    pub network_name: String,

    #[serde(default)]
    pub node_tags: Vec<String>,

    #[serde(default)]
    pub node_scopes: Vec<String>,
}

/// The nested cluster-api object: network layout, opaque provider spec
/// and the endpoints discovered once a control plane exists.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ClusterApi {
    #[serde(default)]
    pub cluster_network: ClusterNetwork,

    #[serde(default)]
    pub provider_spec: ProviderSpec,

    #[serde(default)]
    pub status: ClusterApiStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ClusterNetwork {
    #[serde(default)]
    pub pods: Vec<String>,

    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default)]
    pub service_domain: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ClusterApiStatus {
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

/// High-level state of a Cluster; the single switch `apply` routes on.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Fresh record, nothing provisioned yet.
    #[default]
    #[serde(rename = "")]
    Unknown,
    Pending,
    Ready,
    Upgrading,
    Deleting,
    Deleted,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::Unknown => "",
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Ready => "Ready",
            ClusterPhase::Upgrading => "Upgrading",
            ClusterPhase::Deleting => "Deleting",
            ClusterPhase::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

impl FromStr for ClusterPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(ClusterPhase::Unknown),
            "Pending" => Ok(ClusterPhase::Pending),
            "Ready" => Ok(ClusterPhase::Ready),
            "Upgrading" => Ok(ClusterPhase::Upgrading),
            "Deleting" => Ok(ClusterPhase::Deleting),
            "Deleted" => Ok(ClusterPhase::Deleted),
            other => Err(format!("unknown cluster phase: {other}")),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Last apply error, cleared on success.
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub cloud: CloudStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct CloudStatus {
    /// Cloud-side id of the registered public key. Non-empty iff the key
    /// has been uploaded.
    #[serde(default)]
    pub ssh_key_external_id: String,

    #[serde(default)]
    pub load_balancer: LoadBalancer,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gce: Option<GceStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct LoadBalancer {
    #[serde(default)]
    pub dns: String,

    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct GceStatus {
    #[serde(default)]
    pub reserved_ip: String,
}

impl Cluster {
    pub fn config(&self) -> &ClusterConfig {
        &self.spec.config
    }

    /// Name of the (single) control-plane machine.
    pub fn master_machine_name(&self) -> String {
        format!("{}-master", self.name)
    }

    pub fn api_server_url(&self) -> Option<String> {
        self.spec
            .cluster_api
            .status
            .api_endpoints
            .first()
            .map(|ep| {
                if ep.port == 0 {
                    format!("https://{}", ep.host)
                } else {
                    format!("https://{}:{}", ep.host, ep.port)
                }
            })
    }

    /// Records the API endpoint from the master's addresses, preferring
    /// external DNS, then external IP, then internal IP.
    pub fn set_api_endpoints(&mut self, addresses: &[NodeAddress]) -> Result<(), String> {
        let mut by_kind = BTreeMap::new();
        for addr in addresses {
            by_kind.insert(addr.kind, addr.address.clone());
        }
        let host = by_kind
            .get(&NodeAddressKind::ExternalDns)
            .or_else(|| by_kind.get(&NodeAddressKind::ExternalIp))
            .or_else(|| by_kind.get(&NodeAddressKind::InternalIp))
            .cloned()
            .ok_or_else(|| "no usable address on master node".to_string())?;
        self.spec.cluster_api.status.api_endpoints = vec![ApiEndpoint {
            host,
            port: KUBERNETES_BIND_PORT,
        }];
        Ok(())
    }

    /// Tag attached to every cloud resource owned by this cluster.
    pub fn cluster_tag(&self) -> String {
        format!("KubernetesCluster:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_strings() {
        for phase in [
            ClusterPhase::Unknown,
            ClusterPhase::Pending,
            ClusterPhase::Ready,
            ClusterPhase::Upgrading,
            ClusterPhase::Deleting,
            ClusterPhase::Deleted,
        ] {
            assert_eq!(phase.to_string().parse::<ClusterPhase>().unwrap(), phase);
        }
        assert!("Bogus".parse::<ClusterPhase>().is_err());
    }

    #[test]
    fn api_endpoints_prefer_external_addresses() {
        let mut cluster = Cluster {
            name: "do-1".into(),
            ..Default::default()
        };
        cluster
            .set_api_endpoints(&[
                NodeAddress {
                    kind: NodeAddressKind::InternalIp,
                    address: "10.0.0.4".into(),
                },
                NodeAddress {
                    kind: NodeAddressKind::ExternalIp,
                    address: "203.0.113.10".into(),
                },
            ])
            .unwrap();
        assert_eq!(
            cluster.api_server_url().as_deref(),
            Some("https://203.0.113.10:6443")
        );
    }

    #[test]
    fn set_api_endpoints_requires_an_address() {
        let mut cluster = Cluster::default();
        assert!(cluster.set_api_endpoints(&[]).is_err());
    }

    #[test]
    fn empty_phase_deserializes_to_unknown() {
        let cluster: Cluster =
            serde_json::from_str(r#"{"name":"c1","status":{"phase":""}}"#).unwrap();
        assert_eq!(cluster.status.phase, ClusterPhase::Unknown);
    }
}

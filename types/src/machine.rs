use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Opaque, provider-tagged payload embedded in Machines and Clusters.
/// Unknown providers are forwarded untouched; known providers decode it
/// into their own spec type at the edge.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ProviderSpec {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl ProviderSpec {
    pub fn encode<T: Serialize>(
        api_version: &str,
        kind: &str,
        spec: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(ProviderSpec {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            value: Some(serde_json::to_value(spec)?),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let value = self.value.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MachineRole {
    Master,
    Node,
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineRole::Master => f.write_str("master"),
            MachineRole::Node => f.write_str("node"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MachineVersions {
    #[serde(default)]
    pub control_plane: String,

    #[serde(default)]
    pub kubelet: String,
}

/// One node, control plane or worker.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Machine {
    pub name: String,

    pub cluster_name: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub spec: MachineSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MachineSpec {
    #[serde(default)]
    pub roles: Vec<MachineRole>,

    #[serde(default)]
    pub provider_spec: ProviderSpec,

    #[serde(default)]
    pub versions: MachineVersions,
}

impl Machine {
    pub fn is_master(&self) -> bool {
        self.spec.roles.contains(&MachineRole::Master)
    }
}

/// Picks the control-plane machine out of a cluster's machine list.
pub fn master_machine(machines: &[Machine]) -> Option<&Machine> {
    machines.iter().find(|m| m.is_master())
}

/// A replicated worker template. Worker VMs are reconciled by the
/// in-cluster actuator, not by this process.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MachineSet {
    pub name: String,

    pub cluster_name: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub spec: MachineSetSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MachineSetSpec {
    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub template: MachineTemplate,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MachineTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub spec: MachineSpec,
}

//! Typed surface of the GCE compute v1 API, narrowed to what the
//! reconciler touches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::CloudError;

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceOperation {
    pub name: String,
    /// `PENDING`, `RUNNING` or `DONE`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl GceOperation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }
}

/// Which operations collection an async op polls against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpScope {
    Global,
    Region,
    Zone,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceNetwork {
    pub name: String,
    #[serde(default)]
    pub auto_create_subnetworks: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallAllowed {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceFirewall {
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<FirewallAllowed>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceAddress {
    pub name: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceDisk {
    pub name: String,
    #[serde(default)]
    pub size_gb: i64,
    #[serde(rename = "type", default)]
    pub disk_type: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(default)]
    pub nat_ip: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub network_ip: String,
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tags {
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub auto_delete: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceInstance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tags: Tags,
}

impl GceInstance {
    pub fn public_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()
            .and_then(|ni| ni.access_configs.first())
            .map(|ac| ac.nat_ip.as_str())
    }

    pub fn private_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()
            .map(|ni| ni.network_ip.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceHealthCheck {
    pub name: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceTargetPool {
    pub name: String,
    #[serde(default)]
    pub health_checks: Vec<String>,
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceForwardingRule {
    pub name: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "IPProtocol", default)]
    pub ip_protocol: String,
    #[serde(default)]
    pub port_range: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub load_balancing_scheme: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceRoute {
    pub name: String,
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_operation(&self, scope: OpScope, name: &str)
    -> Result<GceOperation, CloudError>;

    async fn get_network(&self, name: &str) -> Result<Option<GceNetwork>, CloudError>;
    async fn insert_network(&self, network: &GceNetwork) -> Result<GceOperation, CloudError>;

    async fn get_firewall(&self, name: &str) -> Result<Option<GceFirewall>, CloudError>;
    async fn insert_firewall(&self, firewall: &GceFirewall) -> Result<GceOperation, CloudError>;
    async fn delete_firewall(&self, name: &str) -> Result<GceOperation, CloudError>;
    async fn list_firewalls(&self) -> Result<Vec<GceFirewall>, CloudError>;

    async fn get_address(&self, name: &str) -> Result<Option<GceAddress>, CloudError>;
    async fn insert_address(&self, address: &GceAddress) -> Result<GceOperation, CloudError>;
    async fn delete_address(&self, name: &str) -> Result<GceOperation, CloudError>;

    async fn get_disk(&self, name: &str) -> Result<Option<GceDisk>, CloudError>;
    async fn insert_disk(&self, disk: &GceDisk) -> Result<GceOperation, CloudError>;
    async fn delete_disk(&self, name: &str) -> Result<GceOperation, CloudError>;
    async fn list_disks(&self) -> Result<Vec<GceDisk>, CloudError>;

    async fn get_instance(&self, name: &str) -> Result<Option<GceInstance>, CloudError>;
    async fn insert_instance(&self, instance: &GceInstance)
    -> Result<GceOperation, CloudError>;
    async fn delete_instance(&self, name: &str) -> Result<GceOperation, CloudError>;
    async fn list_instances(&self) -> Result<Vec<GceInstance>, CloudError>;

    async fn get_health_check(&self, name: &str) -> Result<Option<GceHealthCheck>, CloudError>;
    async fn insert_health_check(
        &self,
        check: &GceHealthCheck,
    ) -> Result<GceOperation, CloudError>;
    async fn delete_health_check(&self, name: &str) -> Result<GceOperation, CloudError>;

    async fn get_target_pool(&self, name: &str) -> Result<Option<GceTargetPool>, CloudError>;
    async fn insert_target_pool(
        &self,
        pool: &GceTargetPool,
    ) -> Result<GceOperation, CloudError>;
    async fn delete_target_pool(&self, name: &str) -> Result<GceOperation, CloudError>;

    async fn get_forwarding_rule(
        &self,
        name: &str,
    ) -> Result<Option<GceForwardingRule>, CloudError>;
    async fn insert_forwarding_rule(
        &self,
        rule: &GceForwardingRule,
    ) -> Result<GceOperation, CloudError>;
    async fn delete_forwarding_rule(&self, name: &str) -> Result<GceOperation, CloudError>;

    async fn list_routes(&self) -> Result<Vec<GceRoute>, CloudError>;
    async fn delete_route(&self, name: &str) -> Result<GceOperation, CloudError>;

    /// Registers an SSH key project-wide via common instance metadata.
    async fn set_common_instance_metadata(
        &self,
        item: &MetadataItem,
    ) -> Result<GceOperation, CloudError>;
}

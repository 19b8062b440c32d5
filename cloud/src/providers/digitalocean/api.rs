//! Typed surface of the DigitalOcean v2 API, narrowed to what the
//! reconciler touches. The trait exists so the engine can run against
//! an in-memory cloud in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::CloudError;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DoSshKey {
    pub id: i64,
    pub fingerprint: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DoTag {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Droplet {
    pub id: i64,
    pub name: String,
    /// `new` while provisioning, `active` once booted.
    pub status: String,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct NetworkV4 {
    pub ip_address: String,
    /// `public` or `private`
    #[serde(rename = "type")]
    pub kind: String,
}

impl Droplet {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn public_ip(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.as_str())
    }

    pub fn private_ip(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "private")
            .map(|n| n.ip_address.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub ssh_keys: Vec<String>,
    pub private_networking: bool,
    pub ipv6: bool,
    pub monitoring: bool,
    pub backups: bool,
    pub user_data: String,
    pub tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ForwardingRule {
    pub entry_protocol: String,
    pub entry_port: u16,
    pub target_protocol: String,
    pub target_port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct HealthCheck {
    pub protocol: String,
    pub port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct StickySessions {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Desired (request) form of an API-server load balancer.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerRequest {
    pub name: String,
    pub region: String,
    pub algorithm: String,
    pub forwarding_rules: Vec<ForwardingRule>,
    pub health_check: HealthCheck,
    pub sticky_sessions: StickySessions,
    pub redirect_http_to_https: bool,
    pub droplet_ids: Vec<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DoLoadBalancer {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub status: String,
    pub region: String,
    pub algorithm: String,
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardingRule>,
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default)]
    pub sticky_sessions: StickySessions,
    #[serde(default)]
    pub redirect_http_to_https: bool,
    #[serde(default)]
    pub droplet_ids: Vec<i64>,
}

#[async_trait]
pub trait DropletApi: Send + Sync {
    async fn get_ssh_key(&self, fingerprint: &str) -> Result<Option<DoSshKey>, CloudError>;
    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<DoSshKey, CloudError>;
    async fn delete_ssh_key(&self, fingerprint: &str) -> Result<(), CloudError>;

    async fn get_tag(&self, name: &str) -> Result<Option<DoTag>, CloudError>;
    async fn create_tag(&self, name: &str) -> Result<DoTag, CloudError>;

    async fn get_droplet(&self, id: i64) -> Result<Option<Droplet>, CloudError>;
    async fn find_droplet(&self, name: &str) -> Result<Option<Droplet>, CloudError>;
    async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet, CloudError>;
    async fn delete_droplet(&self, id: i64) -> Result<(), CloudError>;
    async fn list_droplets_by_tag(&self, tag: &str) -> Result<Vec<Droplet>, CloudError>;
    async fn delete_droplets_by_tag(&self, tag: &str) -> Result<(), CloudError>;

    async fn get_load_balancer(&self, name: &str) -> Result<Option<DoLoadBalancer>, CloudError>;
    async fn create_load_balancer(
        &self,
        req: &LoadBalancerRequest,
    ) -> Result<DoLoadBalancer, CloudError>;
    async fn update_load_balancer(
        &self,
        id: &str,
        req: &LoadBalancerRequest,
    ) -> Result<DoLoadBalancer, CloudError>;
    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError>;
}

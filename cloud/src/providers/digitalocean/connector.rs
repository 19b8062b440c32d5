//! Idempotent primitives over the droplet API, bound to one cluster.

use std::sync::Arc;

use keel_common::wait::{RETRY_INTERVAL, RETRY_TIMEOUT, poll_until};
use keel_types::{Cluster, KUBERNETES_BIND_PORT, Machine, NodeInfo, SshKey};

use crate::CloudError;
use crate::startup;

use super::DoMachineProviderSpec;
use super::api::{
    CreateDropletRequest, DoLoadBalancer, Droplet, DropletApi, ForwardingRule, HealthCheck,
    LoadBalancerRequest, StickySessions,
};

pub struct Connector {
    api: Arc<dyn DropletApi>,
    ssh_key: SshKey,
}

pub fn load_balancer_name(cluster: &str) -> String {
    format!("{cluster}-lb")
}

/// What the API-server load balancer should look like for a cluster.
pub fn desired_load_balancer(cluster: &Cluster, droplet_ids: Vec<i64>) -> LoadBalancerRequest {
    LoadBalancerRequest {
        name: load_balancer_name(&cluster.name),
        region: cluster.spec.config.cloud.region.clone(),
        algorithm: "round_robin".to_string(),
        forwarding_rules: vec![ForwardingRule {
            entry_protocol: "tcp".to_string(),
            entry_port: KUBERNETES_BIND_PORT,
            target_protocol: "tcp".to_string(),
            target_port: KUBERNETES_BIND_PORT,
        }],
        health_check: HealthCheck {
            protocol: "tcp".to_string(),
            port: KUBERNETES_BIND_PORT,
        },
        sticky_sessions: StickySessions {
            kind: "none".to_string(),
        },
        redirect_http_to_https: false,
        droplet_ids,
    }
}

/// Field-by-field drift check between observed and desired.
pub fn load_balancer_differs(observed: &DoLoadBalancer, desired: &LoadBalancerRequest) -> bool {
    let mut observed_ids = observed.droplet_ids.clone();
    let mut desired_ids = desired.droplet_ids.clone();
    observed_ids.sort_unstable();
    desired_ids.sort_unstable();
    observed.algorithm != desired.algorithm
        || observed.forwarding_rules != desired.forwarding_rules
        || observed.health_check != desired.health_check
        || observed.sticky_sessions != desired.sticky_sessions
        || observed.redirect_http_to_https != desired.redirect_http_to_https
        || observed_ids != desired_ids
}

impl Connector {
    pub fn new(api: Arc<dyn DropletApi>, ssh_key: SshKey) -> Connector {
        Connector { api, ssh_key }
    }

    pub fn api(&self) -> &dyn DropletApi {
        self.api.as_ref()
    }

    /// Returns the cloud-side key id when the cluster's public key is
    /// already registered.
    pub async fn get_public_key(&self) -> Result<Option<String>, CloudError> {
        Ok(self
            .api
            .get_ssh_key(&self.ssh_key.fingerprint)
            .await?
            .map(|k| k.id.to_string()))
    }

    pub async fn import_public_key(&self, name: &str) -> Result<String, CloudError> {
        tracing::info!(fingerprint = %self.ssh_key.fingerprint, "importing ssh key");
        let key = self
            .api
            .create_ssh_key(name, &self.ssh_key.public_key_openssh)
            .await?;
        Ok(key.id.to_string())
    }

    pub async fn delete_ssh_key(&self) -> Result<(), CloudError> {
        self.api.delete_ssh_key(&self.ssh_key.fingerprint).await
    }

    pub async fn get_tag(&self, cluster: &Cluster) -> Result<bool, CloudError> {
        Ok(self.api.get_tag(&cluster.cluster_tag()).await?.is_some())
    }

    pub async fn create_tag(&self, cluster: &Cluster) -> Result<(), CloudError> {
        self.api.create_tag(&cluster.cluster_tag()).await?;
        Ok(())
    }

    pub async fn instance_if_exists(
        &self,
        machine: &Machine,
    ) -> Result<Option<Droplet>, CloudError> {
        self.api.find_droplet(&machine.name).await
    }

    /// Creates the droplet for a machine and waits for it to boot.
    pub async fn create_instance(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cloud_config: &str,
    ) -> Result<NodeInfo, CloudError> {
        let spec: DoMachineProviderSpec = machine
            .spec
            .provider_spec
            .decode()
            .map_err(|e| CloudError::InvalidSpec(format!("machine `{}`: {e}", machine.name)))?;
        let request = CreateDropletRequest {
            name: machine.name.clone(),
            region: spec.region,
            size: spec.size,
            image: spec.image,
            ssh_keys: vec![self.ssh_key.fingerprint.clone()],
            private_networking: spec.private_networking,
            ipv6: spec.ipv6,
            monitoring: spec.monitoring,
            backups: spec.backups,
            user_data: startup::startup_script(cluster, machine, cloud_config, ""),
            tags: vec![cluster.cluster_tag()],
        };
        tracing::info!(droplet = %machine.name, region = %request.region, "creating droplet");
        let droplet = self.api.create_droplet(&request).await?;
        let droplet = self.wait_for_active(droplet.id).await?;
        Ok(NodeInfo {
            name: droplet.name.clone(),
            external_id: droplet.id.to_string(),
            public_ip: droplet.public_ip().unwrap_or_default().to_string(),
            private_ip: droplet.private_ip().unwrap_or_default().to_string(),
            disk_ids: Vec::new(),
        })
    }

    async fn wait_for_active(&self, id: i64) -> Result<Droplet, CloudError> {
        let droplet = poll_until(RETRY_INTERVAL, RETRY_TIMEOUT, || async {
            let droplet = self
                .api
                .get_droplet(id)
                .await?
                .ok_or_else(|| CloudError::not_found("droplet", id.to_string()))?;
            Ok(droplet.is_active().then_some(droplet))
        })
        .await?;
        Ok(droplet)
    }

    /// `digitalocean://1234` → droplet id.
    pub fn droplet_id_from_provider_id(provider_id: &str) -> Option<i64> {
        provider_id.rsplit('/').next()?.parse().ok()
    }

    pub async fn delete_instance_by_provider_id(&self, provider_id: &str) -> Result<(), CloudError> {
        let Some(id) = Self::droplet_id_from_provider_id(provider_id) else {
            return Err(CloudError::InvalidSpec(format!(
                "malformed provider id `{provider_id}`"
            )));
        };
        self.api.delete_droplet(id).await
    }

    /// Converges the API-server LB toward the desired spec and returns
    /// its address.
    pub async fn reconcile_load_balancer(
        &self,
        cluster: &Cluster,
        droplet_ids: Vec<i64>,
    ) -> Result<DoLoadBalancer, CloudError> {
        let desired = desired_load_balancer(cluster, droplet_ids);
        match self.api.get_load_balancer(&desired.name).await? {
            Some(observed) if load_balancer_differs(&observed, &desired) => {
                tracing::info!(lb = %desired.name, "updating load balancer");
                self.api.update_load_balancer(&observed.id, &desired).await
            }
            Some(observed) => Ok(observed),
            None => {
                tracing::info!(lb = %desired.name, "creating load balancer");
                self.api.create_load_balancer(&desired).await
            }
        }
    }

    pub async fn delete_load_balancer(&self, cluster: &Cluster) -> Result<bool, CloudError> {
        let name = load_balancer_name(&cluster.name);
        match self.api.get_load_balancer(&name).await? {
            Some(lb) => {
                self.api.delete_load_balancer(&lb.id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

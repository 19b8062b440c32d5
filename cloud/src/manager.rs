use async_trait::async_trait;

use keel_types::{
    Action, CALICO_POD_CIDR, CANAL_POD_CIDR, Cluster, ClusterPhase, DEFAULT_SERVICE_CIDR,
    DEFAULT_SERVICE_DOMAIN, FLANNEL_POD_CIDR, MachineRole, MachineSpec, ProviderSpec, SshConfig,
};

use crate::CloudError;
use crate::kubeconfig::KubeConfig;

/// The per-provider reconciliation engine. There is no shared base
/// implementation; providers are plain variants behind this capability
/// set, resolved through the registry.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Fills provider and network defaults on a fresh cluster record.
    async fn set_defaults(&self, cluster: &mut Cluster) -> Result<(), CloudError>;

    /// Converges the cloud toward the spec. With `dry_run` no cloud or
    /// store mutation happens; only the intended action list returns.
    async fn apply(&self, cluster: Cluster, dry_run: bool) -> Result<Vec<Action>, CloudError>;

    async fn get_ssh_config(&self, cluster: &Cluster, node: &str) -> Result<SshConfig, CloudError>;

    async fn get_kube_config(&self, cluster: &Cluster) -> Result<KubeConfig, CloudError>;

    fn get_default_node_spec(&self, cluster: &Cluster, sku: &str)
    -> Result<MachineSpec, CloudError>;

    fn get_default_machine_provider_spec(
        &self,
        cluster: &Cluster,
        sku: &str,
        role: MachineRole,
    ) -> Result<ProviderSpec, CloudError>;
}

/// Provider-independent defaulting every `set_defaults` starts from.
pub fn set_common_defaults(cluster: &mut Cluster) {
    let config = &mut cluster.spec.config;
    if config.cloud.ssh_key_name.is_empty() {
        config.cloud.ssh_key_name = format!("{}-sshkey", cluster.name);
    }
    if config.ca_cert_name.is_empty() {
        config.ca_cert_name = keel_types::CA_NAME.to_string();
    }
    if config.front_proxy_ca_cert_name.is_empty() {
        config.front_proxy_ca_cert_name = keel_types::FRONT_PROXY_CA_NAME.to_string();
    }
    if config.authorization_modes.is_empty() {
        config.authorization_modes = vec!["Node".to_string(), "RBAC".to_string()];
    }

    let network = &mut cluster.spec.cluster_api.cluster_network;
    if network.pods.is_empty() {
        network.pods = vec![default_pod_cidr(&config.cloud.network_provider).to_string()];
    }
    if network.services.is_empty() {
        network.services = vec![DEFAULT_SERVICE_CIDR.to_string()];
    }
    if network.service_domain.is_empty() {
        network.service_domain = DEFAULT_SERVICE_DOMAIN.to_string();
    }

    if cluster.status.phase == ClusterPhase::Unknown {
        cluster.status.phase = ClusterPhase::Pending;
    }
}

pub fn default_pod_cidr(network_provider: &str) -> &'static str {
    match network_provider {
        "calico" => CALICO_POD_CIDR,
        "flannel" => FLANNEL_POD_CIDR,
        // canal is the default CNI
        _ => CANAL_POD_CIDR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidrs_follow_the_network_provider() {
        assert_eq!(default_pod_cidr("calico"), "192.168.0.0/16");
        assert_eq!(default_pod_cidr("flannel"), "10.244.0.0/16");
        assert_eq!(default_pod_cidr("canal"), "10.244.0.0/16");
        assert_eq!(default_pod_cidr(""), "10.244.0.0/16");
    }

    #[test]
    fn common_defaults_fill_blanks_only() {
        let mut cluster = Cluster {
            name: "do-1".into(),
            ..Default::default()
        };
        cluster.spec.config.cloud.network_provider = "calico".into();
        set_common_defaults(&mut cluster);
        assert_eq!(cluster.status.phase, ClusterPhase::Pending);
        assert_eq!(cluster.spec.cluster_api.cluster_network.pods, vec!["192.168.0.0/16"]);
        assert_eq!(
            cluster.spec.cluster_api.cluster_network.service_domain,
            "cluster.local"
        );
        assert_eq!(cluster.spec.config.cloud.ssh_key_name, "do-1-sshkey");

        // A second pass changes nothing.
        let before = cluster.clone();
        set_common_defaults(&mut cluster);
        assert_eq!(cluster, before);
    }
}

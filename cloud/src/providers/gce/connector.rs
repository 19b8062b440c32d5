//! Idempotent primitives over the compute API, bound to one cluster.

use std::sync::Arc;

use futures::future::join_all;

use keel_common::wait::{RETRY_INTERVAL, RETRY_TIMEOUT, poll_until};
use keel_types::{Cluster, KUBERNETES_BIND_PORT, Machine, NodeInfo, SshKey};

use crate::CloudError;
use crate::error::ignore_not_found;
use crate::startup;

use super::GceMachineProviderSpec;
use super::api::{
    AccessConfig, AttachedDisk, ComputeApi, FirewallAllowed, GceAddress, GceDisk, GceFirewall,
    GceHealthCheck, GceInstance, GceNetwork, GceOperation, GceTargetPool, GceForwardingRule,
    Metadata, MetadataItem, NetworkInterface, OpScope, Tags,
};

pub const DEFAULT_NETWORK: &str = "default";

/// GCE internal broadcast range allowed for intra-cluster traffic.
const INTERNAL_RANGE: &str = "10.128.0.0/9";

pub struct Connector {
    api: Arc<dyn ComputeApi>,
    ssh_key: SshKey,
}

pub fn load_balancer_name(cluster: &str) -> String {
    format!("{cluster}-apiserver")
}

pub fn master_tags(cluster: &str) -> Vec<String> {
    vec![format!("{cluster}-master"), "https-server".to_string()]
}

/// The firewall set every cluster gets: internal traffic, SSH, and the
/// public API server ports.
pub fn firewall_rules(cluster: &str, network: &str) -> Vec<GceFirewall> {
    vec![
        GceFirewall {
            name: format!("{cluster}-allow-internal"),
            network: network.to_string(),
            source_ranges: vec![INTERNAL_RANGE.to_string()],
            allowed: vec![
                FirewallAllowed {
                    ip_protocol: "tcp".to_string(),
                    ports: vec!["0-65535".to_string()],
                },
                FirewallAllowed {
                    ip_protocol: "udp".to_string(),
                    ports: vec!["0-65535".to_string()],
                },
                FirewallAllowed {
                    ip_protocol: "icmp".to_string(),
                    ports: Vec::new(),
                },
            ],
            target_tags: Vec::new(),
        },
        GceFirewall {
            name: format!("{cluster}-allow-ssh"),
            network: network.to_string(),
            source_ranges: vec!["0.0.0.0/0".to_string()],
            allowed: vec![FirewallAllowed {
                ip_protocol: "tcp".to_string(),
                ports: vec!["22".to_string()],
            }],
            target_tags: Vec::new(),
        },
        GceFirewall {
            name: format!("{cluster}-allow-apiserver"),
            network: network.to_string(),
            source_ranges: vec!["0.0.0.0/0".to_string()],
            allowed: vec![FirewallAllowed {
                ip_protocol: "tcp".to_string(),
                ports: vec!["443".to_string(), KUBERNETES_BIND_PORT.to_string()],
            }],
            target_tags: vec!["https-server".to_string()],
        },
    ]
}

impl Connector {
    pub fn new(api: Arc<dyn ComputeApi>, ssh_key: SshKey) -> Connector {
        Connector { api, ssh_key }
    }

    pub fn api(&self) -> &dyn ComputeApi {
        self.api.as_ref()
    }

    async fn wait_for_operation(
        &self,
        scope: OpScope,
        op: GceOperation,
    ) -> Result<(), CloudError> {
        if op.is_done() || op.name.is_empty() {
            return Ok(());
        }
        poll_until(RETRY_INTERVAL, RETRY_TIMEOUT, || async {
            // Gone means done when polling deletes.
            let polled = match self.api.get_operation(scope, &op.name).await {
                Ok(polled) => polled,
                Err(e) if e.is_not_found() => return Ok(Some(())),
                Err(e) => return Err(e),
            };
            if let Some(error) = polled.error {
                return Err(CloudError::Api {
                    status: 0,
                    message: error.to_string(),
                });
            }
            Ok(polled.is_done().then_some(()))
        })
        .await?;
        Ok(())
    }

    /// The cluster public key is held project-wide; the stored metadata
    /// key doubles as the external id.
    pub async fn import_public_key(&self, key_name: &str) -> Result<String, CloudError> {
        tracing::info!(fingerprint = %self.ssh_key.fingerprint, "importing ssh key");
        let op = self
            .api
            .set_common_instance_metadata(&MetadataItem {
                key: key_name.to_string(),
                value: self.ssh_key.public_key_openssh.clone(),
            })
            .await?;
        self.wait_for_operation(OpScope::Global, op).await?;
        Ok(key_name.to_string())
    }

    pub async fn ensure_network(&self, name: &str) -> Result<bool, CloudError> {
        if self.api.get_network(name).await?.is_some() {
            return Ok(false);
        }
        tracing::info!(network = name, "creating network");
        let op = self
            .api
            .insert_network(&GceNetwork {
                name: name.to_string(),
                auto_create_subnetworks: true,
            })
            .await?;
        self.wait_for_operation(OpScope::Global, op).await?;
        Ok(true)
    }

    /// Returns the names of rules that had to be created.
    pub async fn ensure_firewall_rules(
        &self,
        cluster: &str,
        network: &str,
    ) -> Result<Vec<String>, CloudError> {
        let mut created = Vec::new();
        for rule in firewall_rules(cluster, network) {
            if self.api.get_firewall(&rule.name).await?.is_some() {
                continue;
            }
            tracing::info!(firewall = %rule.name, "creating firewall rule");
            let op = self.api.insert_firewall(&rule).await?;
            self.wait_for_operation(OpScope::Global, op).await?;
            created.push(rule.name);
        }
        Ok(created)
    }

    pub async fn missing_firewall_rules(
        &self,
        cluster: &str,
        network: &str,
    ) -> Result<Vec<String>, CloudError> {
        let mut missing = Vec::new();
        for rule in firewall_rules(cluster, network) {
            if self.api.get_firewall(&rule.name).await?.is_none() {
                missing.push(rule.name);
            }
        }
        Ok(missing)
    }

    pub async fn ensure_disk(&self, name: &str, disk: &GceDisk) -> Result<(), CloudError> {
        if self.api.get_disk(name).await?.is_some() {
            return Ok(());
        }
        tracing::info!(disk = name, "creating disk");
        let op = self.api.insert_disk(disk).await?;
        self.wait_for_operation(OpScope::Zone, op).await
    }

    pub async fn reserve_ip(&self, cluster: &Cluster) -> Result<String, CloudError> {
        let name = load_balancer_name(&cluster.name);
        if let Some(address) = self.api.get_address(&name).await? {
            return Ok(address.address);
        }
        tracing::info!(address = %name, "reserving ip");
        let op = self
            .api
            .insert_address(&GceAddress {
                name: name.clone(),
                address: String::new(),
            })
            .await?;
        self.wait_for_operation(OpScope::Region, op).await?;
        let address = self
            .api
            .get_address(&name)
            .await?
            .ok_or_else(|| CloudError::not_found("address", &name))?;
        Ok(address.address)
    }

    pub async fn instance_if_exists(
        &self,
        machine: &Machine,
    ) -> Result<Option<GceInstance>, CloudError> {
        self.api.get_instance(&machine.name).await
    }

    /// Boot disk, public IP, master tags, startup script; waits for the
    /// instance to report RUNNING.
    pub async fn create_master_instance(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cloud_config: &str,
    ) -> Result<NodeInfo, CloudError> {
        let spec: GceMachineProviderSpec = machine
            .spec
            .provider_spec
            .decode()
            .map_err(|e| CloudError::InvalidSpec(format!("machine `{}`: {e}", machine.name)))?;
        let disk_name = format!("{}-pd", machine.name);
        self.ensure_disk(
            &disk_name,
            &GceDisk {
                name: disk_name.clone(),
                size_gb: spec.boot_disk_size_gb,
                disk_type: spec.boot_disk_type.clone(),
            },
        )
        .await?;

        let instance = GceInstance {
            name: machine.name.clone(),
            status: String::new(),
            machine_type: spec.machine_type.clone(),
            network_interfaces: vec![NetworkInterface {
                network_ip: String::new(),
                access_configs: vec![AccessConfig::default()],
            }],
            disks: vec![AttachedDisk {
                boot: true,
                source: disk_name.clone(),
                auto_delete: true,
            }],
            metadata: Metadata {
                items: vec![
                    MetadataItem {
                        key: "startup-script".to_string(),
                        value: startup::startup_script(cluster, machine, cloud_config, ""),
                    },
                    MetadataItem {
                        key: cluster.spec.config.cloud.ssh_key_name.clone(),
                        value: self.ssh_key.public_key_openssh.clone(),
                    },
                ],
            },
            tags: Tags {
                items: master_tags(&cluster.name),
            },
        };
        tracing::info!(instance = %machine.name, "creating master instance");
        let op = self.api.insert_instance(&instance).await?;
        self.wait_for_operation(OpScope::Zone, op).await?;

        let instance = poll_until(RETRY_INTERVAL, RETRY_TIMEOUT, || async {
            let instance = self
                .api
                .get_instance(&machine.name)
                .await?
                .ok_or_else(|| CloudError::not_found("instance", &machine.name))?;
            Ok((instance.status == "RUNNING").then_some(instance))
        })
        .await?;
        Ok(NodeInfo {
            name: instance.name.clone(),
            external_id: instance.name.clone(),
            public_ip: instance.public_ip().unwrap_or_default().to_string(),
            private_ip: instance.private_ip().unwrap_or_default().to_string(),
            disk_ids: vec![disk_name],
        })
    }

    /// Address, health check on 6443, target pool with the leader
    /// master, TCP/6443 forwarding rule. Returns the LB address.
    pub async fn ensure_load_balancer(
        &self,
        cluster: &Cluster,
        leader: &str,
    ) -> Result<String, CloudError> {
        let name = load_balancer_name(&cluster.name);
        let address = self.reserve_ip(cluster).await?;

        if self.api.get_health_check(&name).await?.is_none() {
            let op = self
                .api
                .insert_health_check(&GceHealthCheck {
                    name: name.clone(),
                    port: KUBERNETES_BIND_PORT,
                })
                .await?;
            self.wait_for_operation(OpScope::Global, op).await?;
        }

        if self.api.get_target_pool(&name).await?.is_none() {
            let op = self
                .api
                .insert_target_pool(&GceTargetPool {
                    name: name.clone(),
                    health_checks: vec![name.clone()],
                    instances: vec![leader.to_string()],
                })
                .await?;
            self.wait_for_operation(OpScope::Region, op).await?;
        }

        if self.api.get_forwarding_rule(&name).await?.is_none() {
            let op = self
                .api
                .insert_forwarding_rule(&GceForwardingRule {
                    name: name.clone(),
                    ip_address: address.clone(),
                    ip_protocol: "TCP".to_string(),
                    port_range: KUBERNETES_BIND_PORT.to_string(),
                    target: name.clone(),
                    load_balancing_scheme: "EXTERNAL".to_string(),
                })
                .await?;
            self.wait_for_operation(OpScope::Region, op).await?;
        }
        tracing::info!(lb = %name, %address, "load balancer ready");
        Ok(address)
    }

    pub async fn load_balancer_exists(&self, cluster: &Cluster) -> Result<bool, CloudError> {
        let name = load_balancer_name(&cluster.name);
        Ok(self.api.get_address(&name).await?.is_some()
            && self.api.get_health_check(&name).await?.is_some()
            && self.api.get_target_pool(&name).await?.is_some()
            && self.api.get_forwarding_rule(&name).await?.is_some())
    }

    /// Address, forwarding rule, target pool, health check, in that
    /// order, each preceded by a GET so "already gone" is not an error.
    pub async fn delete_load_balancer(&self, cluster: &Cluster) -> Result<(), CloudError> {
        let name = load_balancer_name(&cluster.name);
        if self.api.get_address(&name).await?.is_some() {
            let op = self.api.delete_address(&name).await?;
            self.wait_for_operation(OpScope::Region, op).await?;
        }
        if self.api.get_forwarding_rule(&name).await?.is_some() {
            let op = self.api.delete_forwarding_rule(&name).await?;
            self.wait_for_operation(OpScope::Region, op).await?;
        }
        if self.api.get_target_pool(&name).await?.is_some() {
            let op = self.api.delete_target_pool(&name).await?;
            self.wait_for_operation(OpScope::Region, op).await?;
        }
        if self.api.get_health_check(&name).await?.is_some() {
            let op = self.api.delete_health_check(&name).await?;
            self.wait_for_operation(OpScope::Global, op).await?;
        }
        Ok(())
    }

    /// Deletes master instances in parallel, joining before return.
    pub async fn delete_instances(&self, names: Vec<String>) -> Result<(), CloudError> {
        let deletions = names.into_iter().map(|name| {
            let api = self.api.clone();
            async move {
                tracing::info!(instance = %name, "deleting instance");
                let op = match ignore_not_found(api.delete_instance(&name).await)? {
                    Some(op) => op,
                    None => return Ok(()),
                };
                if op.is_done() || op.name.is_empty() {
                    return Ok(());
                }
                poll_until(RETRY_INTERVAL, RETRY_TIMEOUT, || async {
                    match api.get_operation(OpScope::Zone, &op.name).await {
                        Ok(polled) => Ok(polled.is_done().then_some(())),
                        Err(e) if e.is_not_found() => Ok(Some(())),
                        Err(e) => Err(e),
                    }
                })
                .await
                .map_err(CloudError::from)
            }
        });
        for result in join_all(deletions).await {
            result?;
        }
        Ok(())
    }

    /// Deletes leftover disks in parallel.
    pub async fn delete_disks_by_prefix(&self, prefix: &str) -> Result<(), CloudError> {
        let disks: Vec<String> = self
            .api
            .list_disks()
            .await?
            .into_iter()
            .filter(|d| d.name.starts_with(prefix))
            .map(|d| d.name)
            .collect();
        let deletions = disks.into_iter().map(|name| {
            let api = self.api.clone();
            async move { ignore_not_found(api.delete_disk(&name).await).map(|_| ()) }
        });
        for result in join_all(deletions).await {
            result?;
        }
        Ok(())
    }

    pub async fn delete_routes_by_prefix(&self, prefix: &str) -> Result<(), CloudError> {
        for route in self.api.list_routes().await? {
            if route.name.starts_with(prefix) {
                ignore_not_found(self.api.delete_route(&route.name).await)?;
            }
        }
        Ok(())
    }

    pub async fn delete_firewalls_by_prefix(&self, prefix: &str) -> Result<(), CloudError> {
        for firewall in self.api.list_firewalls().await? {
            if firewall.name.starts_with(prefix) {
                let op = match ignore_not_found(self.api.delete_firewall(&firewall.name).await)? {
                    Some(op) => op,
                    None => continue,
                };
                self.wait_for_operation(OpScope::Global, op).await?;
            }
        }
        Ok(())
    }

    pub async fn release_reserved_ip(&self, cluster: &Cluster) -> Result<(), CloudError> {
        let name = load_balancer_name(&cluster.name);
        if self.api.get_address(&name).await?.is_some() {
            let op = self.api.delete_address(&name).await?;
            self.wait_for_operation(OpScope::Region, op).await?;
        }
        Ok(())
    }

    /// Instances that belong to the cluster, by naming convention.
    pub async fn list_cluster_instances(&self, cluster: &str) -> Result<Vec<String>, CloudError> {
        Ok(self
            .api
            .list_instances()
            .await?
            .into_iter()
            .filter(|i| i.name.starts_with(&format!("{cluster}-")))
            .map(|i| i.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firewall_set_covers_internal_ssh_and_apiserver() {
        let rules = firewall_rules("gc-1", DEFAULT_NETWORK);
        assert_eq!(rules.len(), 3);

        let internal = &rules[0];
        assert_eq!(internal.source_ranges, vec!["10.128.0.0/9"]);

        let ssh = &rules[1];
        assert_eq!(ssh.source_ranges, vec!["0.0.0.0/0"]);
        assert_eq!(ssh.allowed[0].ports, vec!["22"]);

        let apiserver = &rules[2];
        assert_eq!(apiserver.allowed[0].ports, vec!["443", "6443"]);
        assert_eq!(apiserver.target_tags, vec!["https-server"]);
    }

    #[test]
    fn master_tags_carry_the_https_marker() {
        assert_eq!(master_tags("gc-1"), vec!["gc-1-master", "https-server"]);
        assert_eq!(load_balancer_name("gc-1"), "gc-1-apiserver");
    }
}

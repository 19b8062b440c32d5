//! GCE cluster manager: compute-v1 backed control plane behind a
//! target-pool load balancer, name-prefix scoped teardown.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use keel_types::{
    Action, ApiEndpoint, Cluster, ClusterPhase, CredentialSchema, KUBERNETES_BIND_PORT,
    LoadBalancer, Machine, MachineRole, MachineSpec, MachineVersions, ProviderSpec, SshConfig,
    master_machine,
};

use crate::context::Context;
use crate::error::CloudError;
use crate::kube::{self, AdminClient, BootstrapClient};
use crate::kubeconfig::{KubeConfig, admin_kubeconfig};
use crate::manager::set_common_defaults;
use crate::{clusterapi, engine, plan, registry};

pub mod api;
mod client;
mod connector;
#[cfg(test)]
mod tests;

pub use client::GceClient;
pub use connector::Connector;

use api::ComputeApi;

pub const UID: &str = "gce";

const PROVIDER_SPEC_API_VERSION: &str = "gce.keel.io/v1alpha1";
const PROVIDER_SPEC_KIND: &str = "GceMachineProviderSpec";

const DEFAULT_MACHINE_TYPE: &str = "n1-standard-2";
const DEFAULT_IMAGE: &str = "ubuntu-1804-bionic-v20190212";
const DEFAULT_IMAGE_PROJECT: &str = "ubuntu-os-cloud";
const DEFAULT_BOOT_DISK_TYPE: &str = "pd-standard";
const DEFAULT_BOOT_DISK_SIZE_GB: i64 = 100;
const DEFAULT_SSH_USER: &str = "ubuntu";

pub const CREDENTIAL_SCHEMA: CredentialSchema = CredentialSchema {
    provider: UID,
    required_fields: &["project_id", "access_token"],
};

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct GceMachineProviderSpec {
    pub zone: String,
    pub machine_type: String,
    pub image: String,

    #[serde(default)]
    pub image_project: String,

    #[serde(default)]
    pub boot_disk_type: String,

    #[serde(default)]
    pub boot_disk_size_gb: i64,
}

pub fn register() {
    registry::register(UID, CREDENTIAL_SCHEMA, |ctx| {
        Ok(Arc::new(ClusterManager::new(ctx.clone())))
    });
}

pub struct ClusterManager {
    ctx: Context,
    api_override: Option<Arc<dyn ComputeApi>>,
    admin: Mutex<Option<Arc<dyn AdminClient>>>,
    bootstrap: Mutex<Option<Arc<dyn BootstrapClient>>>,
}

impl ClusterManager {
    pub fn new(ctx: Context) -> ClusterManager {
        ClusterManager {
            ctx,
            api_override: None,
            admin: Mutex::new(None),
            bootstrap: Mutex::new(None),
        }
    }

    pub fn with_api(ctx: Context, api: Arc<dyn ComputeApi>) -> ClusterManager {
        ClusterManager {
            api_override: Some(api),
            ..ClusterManager::new(ctx)
        }
    }

    fn api(&self, cluster: &Cluster) -> Result<Arc<dyn ComputeApi>, CloudError> {
        if let Some(api) = &self.api_override {
            return Ok(api.clone());
        }
        let credential = self.ctx.credential()?;
        let token = credential.data.get("access_token").cloned().unwrap_or_default();
        let project = credential.data.get("project_id").cloned().unwrap_or_default();
        Ok(Arc::new(GceClient::new(
            token,
            project,
            cluster.spec.config.cloud.region.clone(),
            cluster.spec.config.cloud.zone.clone(),
        )?))
    }

    fn connector(&self, cluster: &Cluster) -> Result<Connector, CloudError> {
        Ok(Connector::new(self.api(cluster)?, self.ctx.ssh_key()?.clone()))
    }

    fn network_name(cluster: &Cluster) -> String {
        cluster
            .spec
            .config
            .cloud
            .gce
            .as_ref()
            .map(|g| g.network_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| connector::DEFAULT_NETWORK.to_string())
    }

    fn cloud_config(&self, cluster: &Cluster) -> Result<String, CloudError> {
        let credential = self.ctx.credential()?;
        let project = credential.data.get("project_id").cloned().unwrap_or_default();
        Ok(format!(
            "[global]\nproject-id = {}\nnetwork-name = {}\nnode-tags = {}\n",
            project,
            Self::network_name(cluster),
            cluster.name
        ))
    }

    async fn admin_client(&self, cluster: &Cluster) -> Result<Arc<dyn AdminClient>, CloudError> {
        let mut guard = self.admin.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = self.ctx.kube().admin(cluster, self.ctx.pki()?).await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn bootstrap_client(
        &self,
        cluster: &Cluster,
    ) -> Result<Arc<dyn BootstrapClient>, CloudError> {
        let mut guard = self.bootstrap.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = self.ctx.kube().bootstrap(cluster, self.ctx.pki()?).await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn master_machine(&self, cluster: &Cluster) -> Result<Machine, CloudError> {
        let machines = self.ctx.store().machines(&cluster.name).list().await?;
        master_machine(&machines).cloned().ok_or_else(|| {
            CloudError::InvalidSpec(format!("cluster `{}` has no master machine", cluster.name))
        })
    }

    async fn ensure_cloud_resources(
        &self,
        cluster: &mut Cluster,
        dry_run: bool,
        actions: &mut Vec<Action>,
    ) -> Result<(), CloudError> {
        let conn = self.connector(cluster)?;
        let network = Self::network_name(cluster);

        if cluster.status.cloud.ssh_key_external_id.is_empty() {
            actions.push(Action::add("PublicKey", "public key will be imported"));
            if !dry_run {
                cluster.status.cloud.ssh_key_external_id = conn
                    .import_public_key(&cluster.spec.config.cloud.ssh_key_name)
                    .await?;
            }
        } else {
            actions.push(Action::nop("PublicKey", "public key found"));
        }

        if conn.api().get_network(&network).await?.is_some() {
            actions.push(Action::nop("Network", format!("network {network} found")));
        } else {
            actions.push(Action::add(
                "Network",
                format!("network {network} will be created"),
            ));
            if !dry_run {
                conn.ensure_network(&network).await?;
            }
        }

        let missing = conn.missing_firewall_rules(&cluster.name, &network).await?;
        if missing.is_empty() {
            actions.push(Action::nop("Firewall", "firewall rules found"));
        } else {
            actions.push(Action::add(
                "Firewall",
                format!("firewall rules will be created: {}", missing.join(", ")),
            ));
            if !dry_run {
                conn.ensure_firewall_rules(&cluster.name, &network).await?;
            }
        }

        let master = self.master_machine(cluster).await?;
        match conn.instance_if_exists(&master).await? {
            Some(_) => actions.push(Action::nop(
                "MasterInstance",
                format!("master instance {} already exists", master.name),
            )),
            None => {
                actions.push(Action::add(
                    "MasterInstance",
                    format!("master instance {} will be created", master.name),
                ));
                if !dry_run {
                    conn.create_master_instance(cluster, &master, &self.cloud_config(cluster)?)
                        .await?;
                }
            }
        }

        // API traffic terminates on a target-pool LB fronting the
        // leader master.
        if conn.load_balancer_exists(cluster).await? {
            actions.push(Action::nop("LoadBalancer", "load balancer found"));
            if !dry_run && cluster.spec.cluster_api.status.api_endpoints.is_empty() {
                let address = conn.reserve_ip(cluster).await?;
                record_endpoint(cluster, address);
            }
        } else {
            actions.push(Action::add("LoadBalancer", "load balancer will be created"));
            if !dry_run {
                let address = conn.ensure_load_balancer(cluster, &master.name).await?;
                record_endpoint(cluster, address);
            }
        }
        Ok(())
    }

    async fn apply_create(
        &self,
        cluster: &mut Cluster,
        dry_run: bool,
        actions: &mut Vec<Action>,
    ) -> Result<(), CloudError> {
        self.ensure_cloud_resources(cluster, dry_run, actions).await?;
        if dry_run {
            return Ok(());
        }

        *cluster = self.ctx.store().clusters().update(cluster).await?;

        let admin = self.admin_client(cluster).await?;
        kube::wait_for_ready_master(admin.as_ref()).await?;

        cluster.status.phase = ClusterPhase::Ready;
        cluster.status.reason.clear();
        *cluster = self.ctx.store().clusters().update_status(cluster).await?;

        admin
            .create_secret(
                "kube-system",
                &format!("{UID}-credential"),
                self.ctx.credential()?.data.clone(),
            )
            .await?;

        let master = self.master_machine(cluster).await?;
        let bootstrap = self.bootstrap_client(cluster).await?;
        clusterapi::install(bootstrap.as_ref(), cluster, &master).await?;
        Ok(())
    }

    async fn apply_scale(
        &self,
        cluster: &Cluster,
        dry_run: bool,
        actions: &mut Vec<Action>,
    ) -> Result<(), CloudError> {
        let sets = self.ctx.store().machine_sets(&cluster.name).list().await?;
        if sets.is_empty() {
            return Ok(());
        }
        let bootstrap = if dry_run {
            None
        } else {
            Some(self.bootstrap_client(cluster).await?)
        };
        engine::sync_machine_sets(
            self.ctx.store(),
            cluster,
            sets,
            dry_run,
            actions,
            bootstrap.as_deref(),
        )
        .await
    }

    async fn apply_upgrade(
        &self,
        cluster: &mut Cluster,
        dry_run: bool,
        actions: &mut Vec<Action>,
    ) -> Result<(), CloudError> {
        if dry_run {
            return engine::roll_cluster_version(self.ctx.store(), cluster, true, actions, None)
                .await;
        }
        let bootstrap = self.bootstrap_client(cluster).await?;
        let admin = self.admin_client(cluster).await?;
        engine::roll_cluster_version(
            self.ctx.store(),
            cluster,
            false,
            actions,
            Some((bootstrap.as_ref(), admin.as_ref())),
        )
        .await
    }

    /// Tags are not first-class on GCE; teardown enumerates by the
    /// `<cluster>-` name prefix instead.
    async fn apply_delete(
        &self,
        cluster: &mut Cluster,
        dry_run: bool,
        actions: &mut Vec<Action>,
    ) -> Result<(), CloudError> {
        if !dry_run && cluster.status.phase == ClusterPhase::Ready {
            cluster.status.phase = ClusterPhase::Deleting;
            *cluster = self.ctx.store().clusters().update_status(cluster).await?;
        }
        let conn = self.connector(cluster)?;
        let prefix = format!("{}-", cluster.name);

        actions.push(Action::delete(
            "MasterInstance",
            format!("master instance {} will be deleted", cluster.master_machine_name()),
        ));
        actions.push(Action::delete(
            "Instance",
            format!("instances prefixed {prefix} will be deleted"),
        ));
        actions.push(Action::delete("LoadBalancer", "load balancer will be deleted"));
        actions.push(Action::delete(
            "Firewall",
            format!("firewalls prefixed {prefix} will be deleted"),
        ));
        if dry_run {
            return Ok(());
        }

        let instances = conn.list_cluster_instances(&cluster.name).await?;
        conn.delete_instances(instances).await?;

        conn.delete_load_balancer(cluster).await?;
        conn.delete_routes_by_prefix(&prefix).await?;
        conn.delete_firewalls_by_prefix(&prefix).await?;
        conn.delete_disks_by_prefix(&prefix).await?;
        conn.release_reserved_ip(cluster).await?;

        cluster.status.phase = ClusterPhase::Deleted;
        cluster.status.cloud.ssh_key_external_id.clear();
        cluster.status.reason.clear();
        *cluster = self.ctx.store().clusters().update_status(cluster).await?;
        tracing::info!(cluster = %cluster.name, "cluster deleted");
        Ok(())
    }
}

fn record_endpoint(cluster: &mut Cluster, address: String) {
    cluster.status.cloud.load_balancer = LoadBalancer {
        dns: String::new(),
        ip: address.clone(),
        port: KUBERNETES_BIND_PORT,
    };
    cluster.spec.cluster_api.status.api_endpoints = vec![ApiEndpoint {
        host: address,
        port: KUBERNETES_BIND_PORT,
    }];
}

#[async_trait]
impl crate::manager::ClusterManager for ClusterManager {
    async fn set_defaults(&self, cluster: &mut Cluster) -> Result<(), CloudError> {
        let cloud = &mut cluster.spec.config.cloud;
        if cloud.instance_image.is_empty() {
            cloud.instance_image = DEFAULT_IMAGE.to_string();
        }
        if cloud.instance_image_project.is_empty() {
            cloud.instance_image_project = DEFAULT_IMAGE_PROJECT.to_string();
        }
        if cloud.os.is_empty() {
            cloud.os = "ubuntu".to_string();
        }
        if cloud.gce.is_none() {
            cloud.gce = Some(keel_types::GoogleSpec {
                network_name: connector::DEFAULT_NETWORK.to_string(),
                ..Default::default()
            });
        }
        set_common_defaults(cluster);
        Ok(())
    }

    async fn apply(&self, mut cluster: Cluster, dry_run: bool) -> Result<Vec<Action>, CloudError> {
        let deletion_requested = cluster.deletion_timestamp.is_some();
        let upgrade_requested = if cluster.status.phase == ClusterPhase::Ready
            && !deletion_requested
        {
            let admin = self.admin_client(&cluster).await?;
            plan::upgrade_requested(
                &admin.list_nodes().await?,
                &cluster.spec.config.kubernetes_version,
            )?
        } else {
            false
        };
        let plan = plan::route(cluster.status.phase, deletion_requested, upgrade_requested)
            .map_err(|e| e.into_cloud_error(&cluster.name))?;

        let mut actions = Vec::new();
        if plan.upgrade {
            if !dry_run {
                cluster.status.phase = ClusterPhase::Upgrading;
                cluster = self.ctx.store().clusters().update_status(&cluster).await?;
            }
            self.apply_upgrade(&mut cluster, dry_run, &mut actions).await?;
            return Ok(actions);
        }

        if plan.create {
            self.apply_create(&mut cluster, dry_run, &mut actions).await?;
        } else if plan.scale && !plan.delete {
            self.ensure_cloud_resources(&mut cluster, dry_run, &mut actions)
                .await?;
        }

        if plan.zero_replicas && !dry_run {
            engine::zero_machine_set_replicas(self.ctx.store(), &cluster).await?;
        }

        if plan.scale {
            self.apply_scale(&cluster, dry_run, &mut actions).await?;
        }

        if plan.delete {
            self.apply_delete(&mut cluster, dry_run, &mut actions).await?;
        }
        Ok(actions)
    }

    async fn get_ssh_config(&self, cluster: &Cluster, node: &str) -> Result<SshConfig, CloudError> {
        let conn = self.connector(cluster)?;
        let machine = Machine {
            name: node.to_string(),
            cluster_name: cluster.name.clone(),
            ..Default::default()
        };
        let instance = conn
            .instance_if_exists(&machine)
            .await?
            .ok_or_else(|| CloudError::not_found("instance", node))?;
        Ok(SshConfig {
            user: DEFAULT_SSH_USER.to_string(),
            host: instance.public_ip().unwrap_or_default().to_string(),
            port: 22,
            private_key_pem: self.ctx.ssh_key()?.private_key_pem.clone(),
        })
    }

    async fn get_kube_config(&self, cluster: &Cluster) -> Result<KubeConfig, CloudError> {
        admin_kubeconfig(cluster, self.ctx.pki()?)
    }

    fn get_default_node_spec(
        &self,
        cluster: &Cluster,
        sku: &str,
    ) -> Result<MachineSpec, CloudError> {
        Ok(MachineSpec {
            roles: vec![MachineRole::Node],
            provider_spec: self.get_default_machine_provider_spec(cluster, sku, MachineRole::Node)?,
            versions: MachineVersions {
                control_plane: String::new(),
                kubelet: cluster.spec.config.kubernetes_version.clone(),
            },
        })
    }

    fn get_default_machine_provider_spec(
        &self,
        cluster: &Cluster,
        sku: &str,
        _role: MachineRole,
    ) -> Result<ProviderSpec, CloudError> {
        let machine_type = if sku.is_empty() { DEFAULT_MACHINE_TYPE } else { sku };
        let spec = GceMachineProviderSpec {
            zone: cluster.spec.config.cloud.zone.clone(),
            machine_type: machine_type.to_string(),
            image: cluster.spec.config.cloud.instance_image.clone(),
            image_project: cluster.spec.config.cloud.instance_image_project.clone(),
            boot_disk_type: DEFAULT_BOOT_DISK_TYPE.to_string(),
            boot_disk_size_gb: DEFAULT_BOOT_DISK_SIZE_GB,
        };
        Ok(ProviderSpec::encode(
            PROVIDER_SPEC_API_VERSION,
            PROVIDER_SPEC_KIND,
            &spec,
        )?)
    }
}

//! DigitalOcean cluster manager: droplet-backed control plane, tag
//! scoped resources, delete-by-tag teardown.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use keel_types::{
    Action, Cluster, ClusterPhase, CredentialSchema, Machine, MachineRole, MachineSpec,
    MachineVersions, ProviderSpec, SshConfig, master_machine,
};

use crate::context::Context;
use crate::error::{CloudError, ignore_not_found};
use crate::kube::{self, AdminClient, BootstrapClient};
use crate::kubeconfig::{KubeConfig, admin_kubeconfig};
use crate::manager::set_common_defaults;
use crate::{clusterapi, engine, plan, registry};

pub mod api;
mod client;
mod connector;
#[cfg(test)]
mod tests;

pub use client::DoClient;
pub use connector::Connector;

use api::DropletApi;

pub const UID: &str = "digitalocean";

const PROVIDER_SPEC_API_VERSION: &str = "digitalocean.keel.io/v1alpha1";
const PROVIDER_SPEC_KIND: &str = "DigitalOceanMachineProviderSpec";

const DEFAULT_IMAGE: &str = "ubuntu-18-04-x64";
const DEFAULT_SIZE: &str = "s-2vcpu-4gb";
const DEFAULT_SSH_USER: &str = "root";

pub const CREDENTIAL_SCHEMA: CredentialSchema = CredentialSchema {
    provider: UID,
    required_fields: &["token"],
};

/// Machine-level knobs this provider owns, carried as raw provider-spec
/// bytes on the Machine.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DoMachineProviderSpec {
    pub region: String,
    pub size: String,
    pub image: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub ssh_public_keys: Vec<String>,

    #[serde(default)]
    pub private_networking: bool,

    #[serde(default)]
    pub backups: bool,

    #[serde(default)]
    pub ipv6: bool,

    #[serde(default)]
    pub monitoring: bool,
}

pub fn register() {
    registry::register(UID, CREDENTIAL_SCHEMA, |ctx| {
        Ok(Arc::new(ClusterManager::new(ctx.clone())))
    });
}

pub struct ClusterManager {
    ctx: Context,
    api_override: Option<Arc<dyn DropletApi>>,
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

    /// Binds the manager to a given API instead of the live endpoint.
    pub fn with_api(ctx: Context, api: Arc<dyn DropletApi>) -> ClusterManager {
        ClusterManager {
            api_override: Some(api),
            ..ClusterManager::new(ctx)
        }
    }

    fn api(&self) -> Result<Arc<dyn DropletApi>, CloudError> {
        if let Some(api) = &self.api_override {
            return Ok(api.clone());
        }
        let token = self.ctx.credential()?.data.get("token").cloned().unwrap_or_default();
        Ok(Arc::new(DoClient::new(token)?))
    }

    fn connector(&self) -> Result<Connector, CloudError> {
        Ok(Connector::new(self.api()?, self.ctx.ssh_key()?.clone()))
    }

    /// Rendered into the VM so the cloud-controller-manager can reach
    /// the API on its own.
    fn cloud_config(&self) -> Result<String, CloudError> {
        let token = self.ctx.credential()?.data.get("token").cloned().unwrap_or_default();
        Ok(serde_json::to_string(&serde_json::json!({ "token": token }))?)
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

    /// Idempotent cloud prerequisites: ssh key, cluster tag, master
    /// droplet. Records one action per resource; heals whatever is
    /// missing unless `dry_run`.
    async fn ensure_cloud_resources(
        &self,
        cluster: &mut Cluster,
        dry_run: bool,
        actions: &mut Vec<Action>,
    ) -> Result<(), CloudError> {
        let conn = self.connector()?;

        match conn.get_public_key().await? {
            Some(id) => {
                actions.push(Action::nop("PublicKey", "public key found"));
                if !dry_run && cluster.status.cloud.ssh_key_external_id.is_empty() {
                    cluster.status.cloud.ssh_key_external_id = id;
                }
            }
            None => {
                actions.push(Action::add("PublicKey", "public key will be imported"));
                if !dry_run {
                    cluster.status.cloud.ssh_key_external_id = conn
                        .import_public_key(&cluster.spec.config.cloud.ssh_key_name)
                        .await?;
                }
            }
        }

        let tag = cluster.cluster_tag();
        if conn.get_tag(cluster).await? {
            actions.push(Action::nop("Tag", format!("tag {tag} found")));
        } else {
            actions.push(Action::add("Tag", format!("tag {tag} will be added")));
            if !dry_run {
                conn.create_tag(cluster).await?;
            }
        }

        let master = self.master_machine(cluster).await?;
        let mut master_droplet_id = None;
        match conn.instance_if_exists(&master).await? {
            Some(droplet) => {
                actions.push(Action::nop(
                    "MasterInstance",
                    format!("master instance {} already exists", master.name),
                ));
                master_droplet_id = Some(droplet.id);
                if !dry_run && cluster.spec.cluster_api.status.api_endpoints.is_empty() {
                    let info = keel_types::NodeInfo {
                        name: droplet.name.clone(),
                        external_id: droplet.id.to_string(),
                        public_ip: droplet.public_ip().unwrap_or_default().to_string(),
                        private_ip: droplet.private_ip().unwrap_or_default().to_string(),
                        disk_ids: Vec::new(),
                    };
                    cluster
                        .set_api_endpoints(&info.addresses())
                        .map_err(CloudError::InvalidSpec)?;
                }
            }
            None => {
                actions.push(Action::add(
                    "MasterInstance",
                    format!("master instance {} will be created", master.name),
                ));
                if !dry_run {
                    let info = conn
                        .create_instance(cluster, &master, &self.cloud_config()?)
                        .await?;
                    master_droplet_id = info.external_id.parse().ok();
                    cluster
                        .set_api_endpoints(&info.addresses())
                        .map_err(CloudError::InvalidSpec)?;
                }
            }
        }

        // HA control planes sit behind a load balancer on 6443.
        if cluster.spec.config.master_count > 1 {
            self.ensure_load_balancer(cluster, master_droplet_id, dry_run, actions)
                .await?;
        }
        Ok(())
    }

    async fn ensure_load_balancer(
        &self,
        cluster: &mut Cluster,
        master_droplet_id: Option<i64>,
        dry_run: bool,
        actions: &mut Vec<Action>,
    ) -> Result<(), CloudError> {
        let conn = self.connector()?;
        let Some(id) = master_droplet_id else {
            actions.push(Action::add("LoadBalancer", "load balancer will be created"));
            return Ok(());
        };
        let desired = connector::desired_load_balancer(cluster, vec![id]);
        let observed = conn.api().get_load_balancer(&desired.name).await?;
        let record = |cluster: &mut Cluster, lb: &api::DoLoadBalancer| {
            cluster.status.cloud.load_balancer = keel_types::LoadBalancer {
                dns: String::new(),
                ip: lb.ip.clone(),
                port: keel_types::KUBERNETES_BIND_PORT,
            };
            if !lb.ip.is_empty() {
                cluster.spec.cluster_api.status.api_endpoints = vec![keel_types::ApiEndpoint {
                    host: lb.ip.clone(),
                    port: keel_types::KUBERNETES_BIND_PORT,
                }];
            }
        };
        match observed {
            Some(lb) if !connector::load_balancer_differs(&lb, &desired) => {
                actions.push(Action::nop("LoadBalancer", "load balancer in sync"));
                if !dry_run {
                    record(cluster, &lb);
                }
            }
            Some(lb) => {
                actions.push(Action::update("LoadBalancer", "load balancer will be updated"));
                if !dry_run {
                    let lb = conn.api().update_load_balancer(&lb.id, &desired).await?;
                    record(cluster, &lb);
                }
            }
            None => {
                actions.push(Action::add("LoadBalancer", "load balancer will be created"));
                if !dry_run {
                    let lb = conn.api().create_load_balancer(&desired).await?;
                    record(cluster, &lb);
                }
            }
        }
        Ok(())
    }

    /// Creates the network prerequisites and a ready master, then wires
    /// the new control plane up (credential secret, cluster-api).
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

        // The in-cluster cloud-controller-manager needs the credential.
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

    /// Deletes masters, then everything carrying the cluster tag, the
    /// load balancer, and finally the cloud-side ssh key.
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
        let conn = self.connector()?;

        actions.push(Action::delete(
            "MasterInstance",
            format!("master instance {} will be deleted", cluster.master_machine_name()),
        ));
        if !dry_run {
            // Prefer the provider ids the live cluster reports; fall
            // back to a name lookup when the control plane is gone.
            let provider_ids = match self.admin_client(cluster).await {
                Ok(admin) => match admin.list_nodes().await {
                    Ok(nodes) => nodes
                        .into_iter()
                        .filter(|n| n.is_master && !n.provider_id.is_empty())
                        .map(|n| n.provider_id)
                        .collect(),
                    Err(e) => {
                        tracing::warn!(error = %e, "master nodes not listable, falling back to name lookup");
                        Vec::new()
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "control plane unreachable, falling back to name lookup");
                    Vec::new()
                }
            };
            if provider_ids.is_empty() {
                let master = Machine {
                    name: cluster.master_machine_name(),
                    cluster_name: cluster.name.clone(),
                    ..Default::default()
                };
                if let Some(droplet) = conn.instance_if_exists(&master).await? {
                    ignore_not_found(conn.api().delete_droplet(droplet.id).await)?;
                }
            } else {
                // One task per master, join before moving on.
                let api = self.api()?;
                let deletions = provider_ids.into_iter().map(|provider_id| {
                    let api = api.clone();
                    async move {
                        match Connector::droplet_id_from_provider_id(&provider_id) {
                            Some(id) => ignore_not_found(api.delete_droplet(id).await).map(|_| ()),
                            None => Err(CloudError::InvalidSpec(format!(
                                "malformed provider id `{provider_id}`"
                            ))),
                        }
                    }
                });
                for result in join_all(deletions).await {
                    result?;
                }
            }
        }

        let tag = cluster.cluster_tag();
        actions.push(Action::delete(
            "Droplet",
            format!("droplets tagged {tag} will be deleted"),
        ));
        if !dry_run {
            conn.api().delete_droplets_by_tag(&tag).await?;
        }

        let lb_name = connector::load_balancer_name(&cluster.name);
        if conn.api().get_load_balancer(&lb_name).await?.is_some() {
            actions.push(Action::delete("LoadBalancer", "load balancer will be deleted"));
            if !dry_run {
                conn.delete_load_balancer(cluster).await?;
            }
        } else {
            actions.push(Action::nop("LoadBalancer", "load balancer not found"));
        }

        match conn.get_public_key().await? {
            Some(_) => {
                actions.push(Action::delete("PublicKey", "public key will be deleted"));
                if !dry_run {
                    conn.delete_ssh_key().await?;
                }
            }
            None => actions.push(Action::nop("PublicKey", "public key not found")),
        }

        if !dry_run {
            cluster.status.phase = ClusterPhase::Deleted;
            cluster.status.cloud.ssh_key_external_id.clear();
            cluster.status.reason.clear();
            *cluster = self.ctx.store().clusters().update_status(cluster).await?;
            tracing::info!(cluster = %cluster.name, "cluster deleted");
        }
        Ok(())
    }
}

#[async_trait]
impl crate::manager::ClusterManager for ClusterManager {
    async fn set_defaults(&self, cluster: &mut Cluster) -> Result<(), CloudError> {
        if cluster.spec.config.cloud.instance_image.is_empty() {
            cluster.spec.config.cloud.instance_image = DEFAULT_IMAGE.to_string();
        }
        if cluster.spec.config.cloud.os.is_empty() {
            cluster.spec.config.cloud.os = "ubuntu".to_string();
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
            // Converged clusters still get their prerequisites verified
            // so drift shows up as Add actions and gets healed.
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
        let conn = self.connector()?;
        let machine = Machine {
            name: node.to_string(),
            cluster_name: cluster.name.clone(),
            ..Default::default()
        };
        let droplet = conn
            .instance_if_exists(&machine)
            .await?
            .ok_or_else(|| CloudError::not_found("droplet", node))?;
        Ok(SshConfig {
            user: DEFAULT_SSH_USER.to_string(),
            host: droplet.public_ip().unwrap_or_default().to_string(),
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
        let size = if sku.is_empty() { DEFAULT_SIZE } else { sku };
        let spec = DoMachineProviderSpec {
            region: cluster.spec.config.cloud.region.clone(),
            size: size.to_string(),
            image: cluster.spec.config.cloud.instance_image.clone(),
            tags: vec![cluster.cluster_tag()],
            ssh_public_keys: Vec::new(),
            private_networking: true,
            backups: false,
            ipv6: false,
            monitoring: true,
        };
        Ok(ProviderSpec::encode(
            PROVIDER_SPEC_API_VERSION,
            PROVIDER_SPEC_KIND,
            &spec,
        )?)
    }
}

//! GCE engine behavior against an in-memory compute API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use keel_store::Store;
use keel_store::mem::MemBackend;
use keel_types::{
    ActionKind, CloudSpec, Cluster, ClusterConfig, ClusterPhase, ClusterSpec, Credential,
    GoogleSpec, Machine, MachineRole, MachineSpec, MachineVersions,
};

use crate::CloudError;
use crate::context::Context;
use crate::kube::NodeStatus;
use crate::manager::ClusterManager as _;
use crate::testutil::{FakeAdmin, FakeBootstrap, FakeKube, test_pki, test_ssh_key};

use super::api::{
    ComputeApi, GceAddress, GceDisk, GceFirewall, GceForwardingRule, GceHealthCheck,
    GceInstance, GceNetwork, GceOperation, GceRoute, GceTargetPool, MetadataItem, OpScope,
};
use super::{ClusterManager, GceMachineProviderSpec};

fn done() -> GceOperation {
    GceOperation {
        name: String::new(),
        status: "DONE".to_string(),
        error: None,
    }
}

#[derive(Default)]
struct FakeComputeState {
    networks: HashMap<String, GceNetwork>,
    firewalls: HashMap<String, GceFirewall>,
    addresses: HashMap<String, GceAddress>,
    disks: HashMap<String, GceDisk>,
    instances: HashMap<String, GceInstance>,
    health_checks: HashMap<String, GceHealthCheck>,
    target_pools: HashMap<String, GceTargetPool>,
    forwarding_rules: HashMap<String, GceForwardingRule>,
    routes: HashMap<String, GceRoute>,
    metadata: Vec<MetadataItem>,
}

#[derive(Default)]
struct FakeCompute {
    state: Mutex<FakeComputeState>,
    mutations: AtomicUsize,
}

impl FakeCompute {
    fn new() -> Arc<FakeCompute> {
        Arc::new(FakeCompute::default())
    }

    fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn seed_instance(&self, name: &str) {
        self.state.lock().unwrap().instances.insert(
            name.to_string(),
            GceInstance {
                name: name.to_string(),
                status: "RUNNING".to_string(),
                ..Default::default()
            },
        );
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn get_operation(
        &self,
        _scope: OpScope,
        _name: &str,
    ) -> Result<GceOperation, CloudError> {
        Ok(done())
    }

    async fn get_network(&self, name: &str) -> Result<Option<GceNetwork>, CloudError> {
        Ok(self.state.lock().unwrap().networks.get(name).cloned())
    }

    async fn insert_network(&self, network: &GceNetwork) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(network.name.clone(), network.clone());
        Ok(done())
    }

    async fn get_firewall(&self, name: &str) -> Result<Option<GceFirewall>, CloudError> {
        Ok(self.state.lock().unwrap().firewalls.get(name).cloned())
    }

    async fn insert_firewall(&self, firewall: &GceFirewall) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .firewalls
            .insert(firewall.name.clone(), firewall.clone());
        Ok(done())
    }

    async fn delete_firewall(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().firewalls.remove(name);
        Ok(done())
    }

    async fn list_firewalls(&self) -> Result<Vec<GceFirewall>, CloudError> {
        Ok(self.state.lock().unwrap().firewalls.values().cloned().collect())
    }

    async fn get_address(&self, name: &str) -> Result<Option<GceAddress>, CloudError> {
        Ok(self.state.lock().unwrap().addresses.get(name).cloned())
    }

    async fn insert_address(&self, address: &GceAddress) -> Result<GceOperation, CloudError> {
        self.mutated();
        let mut stored = address.clone();
        stored.address = "198.51.100.20".to_string();
        self.state
            .lock()
            .unwrap()
            .addresses
            .insert(stored.name.clone(), stored);
        Ok(done())
    }

    async fn delete_address(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().addresses.remove(name);
        Ok(done())
    }

    async fn get_disk(&self, name: &str) -> Result<Option<GceDisk>, CloudError> {
        Ok(self.state.lock().unwrap().disks.get(name).cloned())
    }

    async fn insert_disk(&self, disk: &GceDisk) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .disks
            .insert(disk.name.clone(), disk.clone());
        Ok(done())
    }

    async fn delete_disk(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().disks.remove(name);
        Ok(done())
    }

    async fn list_disks(&self) -> Result<Vec<GceDisk>, CloudError> {
        Ok(self.state.lock().unwrap().disks.values().cloned().collect())
    }

    async fn get_instance(&self, name: &str) -> Result<Option<GceInstance>, CloudError> {
        Ok(self.state.lock().unwrap().instances.get(name).cloned())
    }

    async fn insert_instance(&self, instance: &GceInstance) -> Result<GceOperation, CloudError> {
        self.mutated();
        let mut stored = instance.clone();
        stored.status = "RUNNING".to_string();
        stored.network_interfaces = vec![super::api::NetworkInterface {
            network_ip: "10.240.0.4".to_string(),
            access_configs: vec![super::api::AccessConfig {
                nat_ip: "203.0.113.30".to_string(),
            }],
        }];
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(stored.name.clone(), stored);
        Ok(done())
    }

    async fn delete_instance(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().instances.remove(name);
        Ok(done())
    }

    async fn list_instances(&self) -> Result<Vec<GceInstance>, CloudError> {
        Ok(self.state.lock().unwrap().instances.values().cloned().collect())
    }

    async fn get_health_check(&self, name: &str) -> Result<Option<GceHealthCheck>, CloudError> {
        Ok(self.state.lock().unwrap().health_checks.get(name).cloned())
    }

    async fn insert_health_check(
        &self,
        check: &GceHealthCheck,
    ) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .health_checks
            .insert(check.name.clone(), check.clone());
        Ok(done())
    }

    async fn delete_health_check(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().health_checks.remove(name);
        Ok(done())
    }

    async fn get_target_pool(&self, name: &str) -> Result<Option<GceTargetPool>, CloudError> {
        Ok(self.state.lock().unwrap().target_pools.get(name).cloned())
    }

    async fn insert_target_pool(&self, pool: &GceTargetPool) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .target_pools
            .insert(pool.name.clone(), pool.clone());
        Ok(done())
    }

    async fn delete_target_pool(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().target_pools.remove(name);
        Ok(done())
    }

    async fn get_forwarding_rule(
        &self,
        name: &str,
    ) -> Result<Option<GceForwardingRule>, CloudError> {
        Ok(self.state.lock().unwrap().forwarding_rules.get(name).cloned())
    }

    async fn insert_forwarding_rule(
        &self,
        rule: &GceForwardingRule,
    ) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .forwarding_rules
            .insert(rule.name.clone(), rule.clone());
        Ok(done())
    }

    async fn delete_forwarding_rule(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().forwarding_rules.remove(name);
        Ok(done())
    }

    async fn list_routes(&self) -> Result<Vec<GceRoute>, CloudError> {
        Ok(self.state.lock().unwrap().routes.values().cloned().collect())
    }

    async fn delete_route(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().routes.remove(name);
        Ok(done())
    }

    async fn set_common_instance_metadata(
        &self,
        item: &MetadataItem,
    ) -> Result<GceOperation, CloudError> {
        self.mutated();
        self.state.lock().unwrap().metadata.push(item.clone());
        Ok(done())
    }
}

fn ready_master(version: &str) -> Vec<NodeStatus> {
    vec![NodeStatus {
        name: "gc-1-master".into(),
        is_master: true,
        ready: true,
        kubelet_version: version.into(),
        provider_id: "gce://acme/us-central1-f/gc-1-master".into(),
        uninitialized: false,
    }]
}

fn test_cluster(phase: ClusterPhase) -> Cluster {
    Cluster {
        name: "gc-1".into(),
        spec: ClusterSpec {
            config: ClusterConfig {
                master_count: 1,
                kubernetes_version: "v1.13.4".into(),
                credential_name: "gce-cred".into(),
                cloud: CloudSpec {
                    cloud_provider: "gce".into(),
                    region: "us-central1".into(),
                    zone: "us-central1-f".into(),
                    instance_image: "ubuntu-1804-bionic-v20190212".into(),
                    ssh_key_name: "gc-1-sshkey".into(),
                    gce: Some(GoogleSpec {
                        network_name: "default".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
        status: keel_types::ClusterStatus {
            phase,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn master_machine_record(cluster: &Cluster) -> Machine {
    let spec = GceMachineProviderSpec {
        zone: "us-central1-f".into(),
        machine_type: "n1-standard-2".into(),
        image: "ubuntu-1804-bionic-v20190212".into(),
        image_project: "ubuntu-os-cloud".into(),
        boot_disk_type: "pd-standard".into(),
        boot_disk_size_gb: 100,
    };
    Machine {
        name: cluster.master_machine_name(),
        cluster_name: cluster.name.clone(),
        spec: MachineSpec {
            roles: vec![MachineRole::Master],
            provider_spec: keel_types::ProviderSpec::encode(
                super::PROVIDER_SPEC_API_VERSION,
                super::PROVIDER_SPEC_KIND,
                &spec,
            )
            .unwrap(),
            versions: MachineVersions {
                control_plane: "v1.13.4".into(),
                kubelet: "v1.13.4".into(),
            },
        },
        ..Default::default()
    }
}

struct Harness {
    store: Store,
    compute: Arc<FakeCompute>,
    admin: Arc<FakeAdmin>,
    manager: ClusterManager,
}

async fn harness(cluster: &Cluster, node_script: Vec<Vec<NodeStatus>>) -> Harness {
    let store = Store::from_backend(MemBackend::new());
    store.clusters().create(cluster).await.unwrap();
    store
        .machines(&cluster.name)
        .create(&master_machine_record(cluster))
        .await
        .unwrap();

    let compute = FakeCompute::new();
    compute.state.lock().unwrap().networks.insert(
        "default".into(),
        GceNetwork {
            name: "default".into(),
            auto_create_subnetworks: true,
        },
    );
    let admin = FakeAdmin::new(node_script);
    let bootstrap = FakeBootstrap::new();
    let mut credential = Credential {
        name: "gce-cred".into(),
        provider: "gce".into(),
        ..Default::default()
    };
    credential.data.insert("project_id".into(), "acme".into());
    credential
        .data
        .insert("access_token".into(), "ya29.test".into());

    let ctx = Context::new(store.clone())
        .with_kube_connector(Arc::new(FakeKube {
            admin: admin.clone(),
            bootstrap,
        }))
        .with_credential(credential)
        .with_pki(test_pki())
        .with_ssh_key(test_ssh_key());
    let manager = ClusterManager::with_api(ctx, compute.clone());
    Harness {
        store,
        compute,
        admin,
        manager,
    }
}

#[test]
fn provider_spec_round_trips() {
    let spec = GceMachineProviderSpec {
        zone: "us-central1-f".into(),
        machine_type: "n1-standard-2".into(),
        image: "ubuntu-1804-bionic-v20190212".into(),
        image_project: "ubuntu-os-cloud".into(),
        boot_disk_type: "pd-standard".into(),
        boot_disk_size_gb: 100,
    };
    let raw = keel_types::ProviderSpec::encode(
        super::PROVIDER_SPEC_API_VERSION,
        super::PROVIDER_SPEC_KIND,
        &spec,
    )
    .unwrap();
    assert_eq!(raw.decode::<GceMachineProviderSpec>().unwrap(), spec);
}

#[tokio::test]
async fn creates_a_cluster_behind_a_target_pool_lb() {
    let cluster = test_cluster(ClusterPhase::Pending);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    let actions = h.manager.apply(cluster.clone(), false).await.unwrap();
    assert!(actions.iter().any(|a| a.resource == "Firewall" && a.kind == ActionKind::Add));
    assert!(actions.iter().any(|a| a.resource == "LoadBalancer" && a.kind == ActionKind::Add));
    assert!(
        actions
            .iter()
            .any(|a| a.resource == "MasterInstance" && a.kind == ActionKind::Add)
    );

    let stored = h.store.clusters().get("gc-1").await.unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Ready);
    assert_eq!(stored.status.cloud.ssh_key_external_id, "gc-1-sshkey");
    // The endpoint is the reserved LB address, not the instance IP.
    assert_eq!(
        stored.spec.cluster_api.status.api_endpoints[0].host,
        "198.51.100.20"
    );
    assert_eq!(stored.spec.cluster_api.status.api_endpoints[0].port, 6443);

    let state = h.compute.state.lock().unwrap();
    assert_eq!(state.firewalls.len(), 3);
    assert!(state.instances.contains_key("gc-1-master"));
    assert!(state.disks.contains_key("gc-1-master-pd"));
    assert!(state.target_pools.contains_key("gc-1-apiserver"));
    assert!(state.forwarding_rules.contains_key("gc-1-apiserver"));
    drop(state);

    assert!(
        h.admin
            .secrets
            .lock()
            .unwrap()
            .contains(&("kube-system".to_string(), "gce-credential".to_string()))
    );
}

#[tokio::test]
async fn second_apply_converges_to_nops() {
    let cluster = test_cluster(ClusterPhase::Pending);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    h.manager.apply(cluster.clone(), false).await.unwrap();
    let mutations = h.compute.mutations();
    let converged = h.store.clusters().get("gc-1").await.unwrap();

    let actions = h.manager.apply(converged, false).await.unwrap();
    assert!(actions.iter().all(|a| a.kind == ActionKind::Nop), "{actions:?}");
    assert_eq!(h.compute.mutations(), mutations);
}

#[tokio::test]
async fn delete_enumerates_by_name_prefix() {
    let mut cluster = test_cluster(ClusterPhase::Ready);
    cluster.deletion_timestamp = Some(Utc::now());
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    {
        let mut state = h.compute.state.lock().unwrap();
        state.disks.insert(
            "gc-1-master-pd".into(),
            GceDisk {
                name: "gc-1-master-pd".into(),
                size_gb: 100,
                disk_type: "pd-standard".into(),
            },
        );
        state.routes.insert("gc-1-route-a".into(), GceRoute { name: "gc-1-route-a".into() });
        for rule in super::connector::firewall_rules("gc-1", "default") {
            state.firewalls.insert(rule.name.clone(), rule);
        }
        state.addresses.insert(
            "gc-1-apiserver".into(),
            GceAddress {
                name: "gc-1-apiserver".into(),
                address: "198.51.100.20".into(),
            },
        );
    }
    h.compute.seed_instance("gc-1-master");
    h.compute.seed_instance("gc-1-pool-a-x2kf");
    h.compute.seed_instance("unrelated-1");

    h.manager.apply(cluster.clone(), false).await.unwrap();

    let stored = h.store.clusters().get("gc-1").await.unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Deleted);

    let state = h.compute.state.lock().unwrap();
    let names: Vec<&String> = state.instances.keys().collect();
    assert_eq!(names, vec![&"unrelated-1".to_string()]);
    assert!(state.disks.is_empty());
    assert!(state.routes.is_empty());
    assert!(state.firewalls.is_empty());
    assert!(state.addresses.is_empty());
}

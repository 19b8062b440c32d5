//! Engine behavior against an in-memory cloud: dry-run purity,
//! idempotence on converged clusters, scale/upgrade/delete flows.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use keel_store::Store;
use keel_store::mem::MemBackend;
use keel_types::{
    Action, ActionKind, CloudSpec, Cluster, ClusterConfig, ClusterPhase, ClusterSpec,
    Credential, Machine, MachineRole, MachineSet, MachineSpec, MachineVersions,
};

use crate::CloudError;
use crate::context::Context;
use crate::kube::NodeStatus;
use crate::manager::ClusterManager as _;
use crate::testutil::{FINGERPRINT, FakeAdmin, FakeBootstrap, FakeKube, test_pki, test_ssh_key};

use super::api::{
    CreateDropletRequest, DoLoadBalancer, DoSshKey, DoTag, Droplet, DropletApi,
    LoadBalancerRequest, NetworkV4, Networks,
};
use super::{ClusterManager, DoMachineProviderSpec};

#[derive(Default)]
struct FakeCloudState {
    ssh_keys: HashMap<String, DoSshKey>,
    tags: HashSet<String>,
    droplets: HashMap<i64, Droplet>,
    load_balancers: HashMap<String, DoLoadBalancer>,
    next_id: i64,
}

#[derive(Default)]
struct FakeCloud {
    state: Mutex<FakeCloudState>,
    mutations: AtomicUsize,
}

impl FakeCloud {
    fn new() -> Arc<FakeCloud> {
        Arc::new(FakeCloud::default())
    }

    fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn droplet_count(&self) -> usize {
        self.state.lock().unwrap().droplets.len()
    }

    /// Seeds a running master droplet plus the cluster's key and tag,
    /// the state a converged create leaves behind.
    fn seed_converged(&self, cluster: &Cluster, fingerprint: &str) {
        let mut state = self.state.lock().unwrap();
        state.ssh_keys.insert(
            fingerprint.to_string(),
            DoSshKey {
                id: 41,
                fingerprint: fingerprint.to_string(),
                name: cluster.spec.config.cloud.ssh_key_name.clone(),
            },
        );
        state.tags.insert(cluster.cluster_tag());
        state.next_id = 100;
        state.droplets.insert(
            7,
            Droplet {
                id: 7,
                name: cluster.master_machine_name(),
                status: "active".into(),
                networks: Networks {
                    v4: vec![NetworkV4 {
                        ip_address: "203.0.113.10".into(),
                        kind: "public".into(),
                    }],
                },
                tags: vec![cluster.cluster_tag()],
            },
        );
    }
}

#[async_trait]
impl DropletApi for FakeCloud {
    async fn get_ssh_key(&self, fingerprint: &str) -> Result<Option<DoSshKey>, CloudError> {
        Ok(self.state.lock().unwrap().ssh_keys.get(fingerprint).cloned())
    }

    async fn create_ssh_key(&self, name: &str, _public_key: &str) -> Result<DoSshKey, CloudError> {
        self.mutated();
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let key = DoSshKey {
            id: state.next_id,
            fingerprint: "aa:bb:cc:dd".into(),
            name: name.to_string(),
        };
        state.ssh_keys.insert(key.fingerprint.clone(), key.clone());
        Ok(key)
    }

    async fn delete_ssh_key(&self, fingerprint: &str) -> Result<(), CloudError> {
        self.mutated();
        self.state.lock().unwrap().ssh_keys.remove(fingerprint);
        Ok(())
    }

    async fn get_tag(&self, name: &str) -> Result<Option<DoTag>, CloudError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tags
            .contains(name)
            .then(|| DoTag { name: name.into() }))
    }

    async fn create_tag(&self, name: &str) -> Result<DoTag, CloudError> {
        self.mutated();
        self.state.lock().unwrap().tags.insert(name.to_string());
        Ok(DoTag { name: name.into() })
    }

    async fn get_droplet(&self, id: i64) -> Result<Option<Droplet>, CloudError> {
        Ok(self.state.lock().unwrap().droplets.get(&id).cloned())
    }

    async fn find_droplet(&self, name: &str) -> Result<Option<Droplet>, CloudError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .droplets
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet, CloudError> {
        self.mutated();
        assert!(!req.user_data.is_empty(), "droplets boot via user-data");
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let droplet = Droplet {
            id: state.next_id,
            name: req.name.clone(),
            status: "active".into(),
            networks: Networks {
                v4: vec![NetworkV4 {
                    ip_address: "203.0.113.10".into(),
                    kind: "public".into(),
                }],
            },
            tags: req.tags.clone(),
        };
        state.droplets.insert(droplet.id, droplet.clone());
        Ok(droplet)
    }

    async fn delete_droplet(&self, id: i64) -> Result<(), CloudError> {
        self.mutated();
        if self.state.lock().unwrap().droplets.remove(&id).is_none() {
            return Err(CloudError::not_found("droplet", id.to_string()));
        }
        Ok(())
    }

    async fn list_droplets_by_tag(&self, tag: &str) -> Result<Vec<Droplet>, CloudError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .droplets
            .values()
            .filter(|d| d.tags.iter().any(|t| t == tag))
            .cloned()
            .collect())
    }

    async fn delete_droplets_by_tag(&self, tag: &str) -> Result<(), CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .droplets
            .retain(|_, d| !d.tags.iter().any(|t| t == tag));
        Ok(())
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<DoLoadBalancer>, CloudError> {
        Ok(self.state.lock().unwrap().load_balancers.get(name).cloned())
    }

    async fn create_load_balancer(
        &self,
        req: &LoadBalancerRequest,
    ) -> Result<DoLoadBalancer, CloudError> {
        self.mutated();
        let lb = DoLoadBalancer {
            id: format!("lb-{}", req.name),
            name: req.name.clone(),
            ip: "198.51.100.9".into(),
            status: "active".into(),
            region: req.region.clone(),
            algorithm: req.algorithm.clone(),
            forwarding_rules: req.forwarding_rules.clone(),
            health_check: req.health_check.clone(),
            sticky_sessions: req.sticky_sessions.clone(),
            redirect_http_to_https: req.redirect_http_to_https,
            droplet_ids: req.droplet_ids.clone(),
        };
        self.state
            .lock()
            .unwrap()
            .load_balancers
            .insert(lb.name.clone(), lb.clone());
        Ok(lb)
    }

    async fn update_load_balancer(
        &self,
        id: &str,
        req: &LoadBalancerRequest,
    ) -> Result<DoLoadBalancer, CloudError> {
        self.mutated();
        let mut lb = self
            .state
            .lock()
            .unwrap()
            .load_balancers
            .get(&req.name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("load balancer", id))?;
        lb.algorithm = req.algorithm.clone();
        lb.droplet_ids = req.droplet_ids.clone();
        self.state
            .lock()
            .unwrap()
            .load_balancers
            .insert(lb.name.clone(), lb.clone());
        Ok(lb)
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError> {
        self.mutated();
        self.state
            .lock()
            .unwrap()
            .load_balancers
            .retain(|_, lb| lb.id != id);
        Ok(())
    }
}

fn ready_master(version: &str) -> Vec<NodeStatus> {
    vec![NodeStatus {
        name: "do-1-master".into(),
        is_master: true,
        ready: true,
        kubelet_version: version.into(),
        provider_id: "digitalocean://7".into(),
        uninitialized: false,
    }]
}

fn test_cluster(phase: ClusterPhase) -> Cluster {
    Cluster {
        name: "do-1".into(),
        spec: ClusterSpec {
            config: ClusterConfig {
                master_count: 1,
                kubernetes_version: "v1.13.4".into(),
                credential_name: "do-cred".into(),
                cloud: CloudSpec {
                    cloud_provider: "digitalocean".into(),
                    region: "nyc3".into(),
                    instance_image: "ubuntu-18-04-x64".into(),
                    ssh_key_name: "do-1-sshkey".into(),
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
    let spec = DoMachineProviderSpec {
        region: "nyc3".into(),
        size: "s-2vcpu-4gb".into(),
        image: "ubuntu-18-04-x64".into(),
        ..Default::default()
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
    cloud: Arc<FakeCloud>,
    admin: Arc<FakeAdmin>,
    bootstrap: Arc<FakeBootstrap>,
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

    let cloud = FakeCloud::new();
    let admin = FakeAdmin::new(node_script);
    let bootstrap = FakeBootstrap::new();
    let mut credential = Credential {
        name: "do-cred".into(),
        provider: "digitalocean".into(),
        ..Default::default()
    };
    credential.data.insert("token".into(), "do-token".into());

    let ctx = Context::new(store.clone())
        .with_kube_connector(Arc::new(FakeKube {
            admin: admin.clone(),
            bootstrap: bootstrap.clone(),
        }))
        .with_credential(credential)
        .with_pki(test_pki())
        .with_ssh_key(test_ssh_key());
    let manager = ClusterManager::with_api(ctx, cloud.clone());
    Harness {
        store,
        cloud,
        admin,
        bootstrap,
        manager,
    }
}

fn kinds(actions: &[Action]) -> Vec<(ActionKind, &str)> {
    actions
        .iter()
        .map(|a| (a.kind, a.resource.as_str()))
        .collect()
}

#[test]
fn provider_spec_round_trips() {
    let spec = DoMachineProviderSpec {
        region: "nyc3".into(),
        size: "s-2vcpu-4gb".into(),
        image: "ubuntu-18-04-x64".into(),
        tags: vec!["KubernetesCluster:do-1".into()],
        private_networking: true,
        monitoring: true,
        ..Default::default()
    };
    let raw = keel_types::ProviderSpec::encode(
        super::PROVIDER_SPEC_API_VERSION,
        super::PROVIDER_SPEC_KIND,
        &spec,
    )
    .unwrap();
    assert_eq!(raw.decode::<DoMachineProviderSpec>().unwrap(), spec);
}

#[tokio::test]
async fn creates_a_single_master_cluster() {
    let cluster = test_cluster(ClusterPhase::Pending);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    let actions = h.manager.apply(cluster.clone(), false).await.unwrap();
    assert_eq!(
        kinds(&actions),
        vec![
            (ActionKind::Add, "PublicKey"),
            (ActionKind::Add, "Tag"),
            (ActionKind::Add, "MasterInstance"),
        ]
    );

    let stored = h.store.clusters().get("do-1").await.unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Ready);
    assert!(!stored.status.cloud.ssh_key_external_id.is_empty());
    let endpoints = &stored.spec.cluster_api.status.api_endpoints;
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].port, 6443);

    // Credential secret and cluster-api objects landed in the cluster.
    assert!(
        h.admin
            .secrets
            .lock()
            .unwrap()
            .contains(&("kube-system".to_string(), "digitalocean-credential".to_string()))
    );
    let applied = h.bootstrap.applied_kinds();
    assert!(applied.contains(&"CustomResourceDefinition".to_string()));
    assert!(applied.contains(&"Cluster".to_string()));
    assert!(applied.contains(&"Machine".to_string()));
}

#[tokio::test]
async fn second_apply_is_all_nops() {
    let cluster = test_cluster(ClusterPhase::Pending);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    h.manager.apply(cluster.clone(), false).await.unwrap();
    let mutations = h.cloud.mutations();
    let converged = h.store.clusters().get("do-1").await.unwrap();

    let actions = h.manager.apply(converged, false).await.unwrap();
    assert!(actions.iter().all(|a| a.kind == ActionKind::Nop), "{actions:?}");
    assert_eq!(h.cloud.mutations(), mutations, "converged apply must not touch the cloud");
}

#[tokio::test]
async fn dry_run_is_pure_and_stable() {
    let cluster = test_cluster(ClusterPhase::Pending);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    let first = h.manager.apply(cluster.clone(), true).await.unwrap();
    let second = h.manager.apply(cluster.clone(), true).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.cloud.mutations(), 0);
    assert_eq!(h.cloud.droplet_count(), 0);

    let stored = h.store.clusters().get("do-1").await.unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Pending);
    assert!(stored.status.cloud.ssh_key_external_id.is_empty());
}

#[tokio::test]
async fn scale_goes_through_the_bootstrap_client() {
    let cluster = test_cluster(ClusterPhase::Ready);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;
    h.cloud.seed_converged(&cluster, FINGERPRINT);

    // Persisted pool wants 3 replicas, the cluster still runs 1.
    let mut pool = MachineSet {
        name: "pool-a".into(),
        cluster_name: "do-1".into(),
        ..Default::default()
    };
    pool.spec.replicas = 3;
    pool.spec.template.spec.versions.kubelet = "v1.13.4".into();
    h.store.machine_sets("do-1").create(&pool).await.unwrap();
    let mut observed = pool.clone();
    observed.spec.replicas = 1;
    h.bootstrap.machine_sets.lock().unwrap().push(observed);

    let droplets_before = h.cloud.droplet_count();
    let actions = h.manager.apply(cluster.clone(), false).await.unwrap();

    assert!(
        actions
            .iter()
            .any(|a| a.kind == ActionKind::Update && a.resource == "MachineSet")
    );
    let pushed: Vec<_> = h
        .bootstrap
        .applied
        .lock()
        .unwrap()
        .iter()
        .filter(|v| v["kind"] == "MachineSet")
        .cloned()
        .collect();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0]["spec"]["replicas"], 3);
    // No direct VM creation at scale time.
    assert_eq!(h.cloud.droplet_count(), droplets_before);
    assert_eq!(
        h.store.clusters().get("do-1").await.unwrap().status.phase,
        ClusterPhase::Ready
    );
}

#[tokio::test]
async fn upgrade_rolls_master_then_pools() {
    let mut cluster = test_cluster(ClusterPhase::Ready);
    cluster.spec.config.kubernetes_version = "v1.13.4".into();
    // Node reports the old kubelet first; after the push it converges.
    let h = harness(
        &cluster,
        vec![ready_master("v1.12.5"), ready_master("v1.13.4")],
    )
    .await;
    h.cloud.seed_converged(&cluster, FINGERPRINT);

    let mut master = h
        .store
        .machines("do-1")
        .get("do-1-master")
        .await
        .unwrap();
    master.spec.versions.control_plane = "v1.12.5".into();
    master.spec.versions.kubelet = "v1.12.5".into();
    h.store.machines("do-1").update(&master).await.unwrap();

    let mut pool = MachineSet {
        name: "pool-a".into(),
        cluster_name: "do-1".into(),
        ..Default::default()
    };
    pool.spec.replicas = 2;
    pool.spec.template.spec.versions.kubelet = "v1.12.5".into();
    h.store.machine_sets("do-1").create(&pool).await.unwrap();

    h.manager.apply(cluster.clone(), false).await.unwrap();

    let master = h.store.machines("do-1").get("do-1-master").await.unwrap();
    assert_eq!(master.spec.versions.control_plane, "v1.13.4");
    assert_eq!(master.spec.versions.kubelet, "v1.13.4");
    let pool = h.store.machine_sets("do-1").get("pool-a").await.unwrap();
    assert_eq!(pool.spec.template.spec.versions.kubelet, "v1.13.4");

    let applied = h.bootstrap.applied_kinds();
    assert!(applied.contains(&"Machine".to_string()));
    assert!(applied.contains(&"MachineSet".to_string()));
    assert_eq!(
        h.store.clusters().get("do-1").await.unwrap().status.phase,
        ClusterPhase::Ready
    );
}

#[tokio::test]
async fn delete_tears_everything_down() {
    let mut cluster = test_cluster(ClusterPhase::Ready);
    cluster.deletion_timestamp = Some(Utc::now());
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;
    h.cloud.seed_converged(&cluster, FINGERPRINT);
    h.cloud
        .create_load_balancer(&super::connector::desired_load_balancer(&cluster, vec![7]))
        .await
        .unwrap();
    h.cloud.mutations.store(0, Ordering::SeqCst);

    let mut pool = MachineSet {
        name: "pool-a".into(),
        cluster_name: "do-1".into(),
        ..Default::default()
    };
    pool.spec.replicas = 3;
    h.store.machine_sets("do-1").create(&pool).await.unwrap();
    h.bootstrap.machine_sets.lock().unwrap().push(pool);

    h.manager.apply(cluster.clone(), false).await.unwrap();

    // Replicas were zeroed before teardown and the pool was pushed.
    let zeroed = h.store.machine_sets("do-1").get("pool-a").await.unwrap();
    assert_eq!(zeroed.spec.replicas, 0);

    let stored = h.store.clusters().get("do-1").await.unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Deleted);
    assert!(stored.status.cloud.ssh_key_external_id.is_empty());

    // Nothing tagged with the cluster remains, the key and LB are gone.
    let state = h.cloud.state.lock().unwrap();
    assert!(state.droplets.is_empty());
    assert!(state.ssh_keys.is_empty());
    assert!(state.load_balancers.is_empty());
}

#[tokio::test]
async fn apply_on_upgrading_is_refused() {
    let cluster = test_cluster(ClusterPhase::Upgrading);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    let err = h.manager.apply(cluster.clone(), false).await.unwrap_err();
    assert!(matches!(err, CloudError::PhaseConflict { .. }));
    assert_eq!(h.cloud.mutations(), 0);
    assert_eq!(
        h.store.clusters().get("do-1").await.unwrap().status.phase,
        ClusterPhase::Upgrading
    );
}

#[tokio::test]
async fn unknown_phase_is_an_error() {
    let cluster = test_cluster(ClusterPhase::Unknown);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    let err = h.manager.apply(cluster, false).await.unwrap_err();
    assert!(err.to_string().contains("unknown phase"), "{err}");
}

#[tokio::test]
async fn deleted_clusters_are_noops() {
    let cluster = test_cluster(ClusterPhase::Deleted);
    let h = harness(&cluster, vec![ready_master("v1.13.4")]).await;

    let actions = h.manager.apply(cluster, false).await.unwrap();
    assert!(actions.is_empty());
    assert_eq!(h.cloud.mutations(), 0);
}

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams,
    Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;

use keel_types::{Cluster, MachineSet, ROLE_MASTER_LABEL, UNINITIALIZED_TAINT};

use crate::CloudError;
use crate::kube::convert;
use crate::kube::{AdminClient, BootstrapClient, KubeConnector, NodeStatus};
use crate::kubeconfig::admin_kubeconfig;
use crate::pki::ClusterPki;

const BOOTSTRAP_NAMESPACE: &str = "default";

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn is_missing(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

async fn connect(cluster: &Cluster, pki: &ClusterPki) -> Result<Client, CloudError> {
    let kubeconfig: Kubeconfig =
        serde_json::from_value(serde_json::to_value(admin_kubeconfig(cluster, pki)?)?)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| CloudError::Bootstrap(e.to_string()))?;
    Ok(Client::try_from(config)?)
}

/// Production connector: talks to the endpoint recorded on the cluster
/// with an admin certificate minted from its CA.
#[derive(Default)]
pub struct DefaultKubeConnector;

#[async_trait]
impl KubeConnector for DefaultKubeConnector {
    async fn admin(
        &self,
        cluster: &Cluster,
        pki: &ClusterPki,
    ) -> Result<Arc<dyn AdminClient>, CloudError> {
        Ok(Arc::new(KubeAdminClient {
            client: connect(cluster, pki).await?,
        }))
    }

    async fn bootstrap(
        &self,
        cluster: &Cluster,
        pki: &ClusterPki,
    ) -> Result<Arc<dyn BootstrapClient>, CloudError> {
        Ok(Arc::new(KubeBootstrapClient {
            client: connect(cluster, pki).await?,
            namespace: BOOTSTRAP_NAMESPACE.to_string(),
        }))
    }
}

pub struct KubeAdminClient {
    client: Client,
}

fn node_status(node: &Node) -> NodeStatus {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let spec = node.spec.clone().unwrap_or_default();
    let status = node.status.clone().unwrap_or_default();
    let ready = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    let uninitialized = spec
        .taints
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|t| t.key == UNINITIALIZED_TAINT);
    NodeStatus {
        name: node.metadata.name.clone().unwrap_or_default(),
        is_master: labels.contains_key(ROLE_MASTER_LABEL),
        ready,
        kubelet_version: status
            .node_info
            .map(|i| i.kubelet_version)
            .unwrap_or_default(),
        provider_id: spec.provider_id.unwrap_or_default(),
        uninitialized,
    }
}

#[async_trait]
impl AdminClient for KubeAdminClient {
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>, CloudError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(node_status).collect())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), CloudError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(data),
            ..Default::default()
        };
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct KubeBootstrapClient {
    client: Client,
    namespace: String,
}

impl KubeBootstrapClient {
    fn dynamic_api(&self, api_version: &str, kind: &str, namespaced: bool) -> Api<DynamicObject> {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = ApiResource::from_gvk(&gvk);
        if namespaced {
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        }
    }

    fn api_for(&self, value: &Value) -> Result<(Api<DynamicObject>, String), CloudError> {
        let (api_version, kind, name) = convert::object_coordinates(value)
            .ok_or_else(|| CloudError::Bootstrap("object without apiVersion/kind/name".into()))?;
        let namespaced = !value["metadata"]["namespace"].is_null()
            || !matches!(kind.as_str(), "CustomResourceDefinition" | "Namespace" | "ClusterRole" | "ClusterRoleBinding");
        Ok((self.dynamic_api(&api_version, &kind, namespaced), name))
    }
}

#[async_trait]
impl BootstrapClient for KubeBootstrapClient {
    async fn apply(&self, object: Value) -> Result<(), CloudError> {
        let (api, name) = self.api_for(&object)?;
        let dynamic: DynamicObject = serde_json::from_value(object.clone())?;
        match api.create(&PostParams::default(), &dynamic).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&object))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, object: Value) -> Result<(), CloudError> {
        let (api, name) = self.api_for(&object)?;
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_machine_sets(
        &self,
        sets: &[MachineSet],
        namespace: &str,
    ) -> Result<(), CloudError> {
        for set in sets {
            let object = convert::machine_set_object(set, namespace);
            let (api, _) = self.api_for(&object)?;
            let dynamic: DynamicObject = serde_json::from_value(object)?;
            match api.create(&PostParams::default(), &dynamic).await {
                Ok(_) => {}
                Err(e) if is_conflict(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn get_machine_sets(&self) -> Result<Vec<MachineSet>, CloudError> {
        let api = self.dynamic_api(convert::CLUSTER_API_VERSION, "MachineSet", true);
        let objects = api.list(&ListParams::default()).await?;
        let mut out = Vec::new();
        for obj in objects.items {
            let value = serde_json::to_value(&obj)?;
            if let Some(set) = convert::machine_set_from_object(&value) {
                out.push(set);
            }
        }
        Ok(out)
    }

    fn context_namespace(&self) -> String {
        self.namespace.clone()
    }
}

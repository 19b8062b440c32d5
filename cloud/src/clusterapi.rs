//! Installs the cluster-api machinery into a freshly provisioned
//! control plane and registers the cluster there, so the in-cluster
//! actuator can take over worker reconciliation.

use serde_json::{Value, json};

use keel_types::{Cluster, Machine};

use crate::CloudError;
use crate::kube::convert;
use crate::kube::BootstrapClient;

const CLUSTER_API_NAMESPACE: &str = "cloud-provider-system";

fn crd(kind: &str, plural: &str) -> Value {
    json!({
        "apiVersion": "apiextensions.k8s.io/v1beta1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{plural}.cluster.k8s.io") },
        "spec": {
            "group": "cluster.k8s.io",
            "version": "v1alpha1",
            "scope": "Namespaced",
            "names": {
                "kind": kind,
                "plural": plural,
            },
            "subresources": { "status": {} },
        },
    })
}

/// The CRDs the cluster-api manager owns.
pub fn crd_objects() -> Vec<Value> {
    vec![
        crd("Cluster", "clusters"),
        crd("Machine", "machines"),
        crd("MachineSet", "machinesets"),
        crd("MachineDeployment", "machinedeployments"),
    ]
}

/// Namespace plus the manager and the provider actuator controller.
pub fn controller_objects(provider: &str) -> Vec<Value> {
    let namespace = json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": CLUSTER_API_NAMESPACE },
    });
    let manager = controller_stateful_set(
        "cluster-api-controller-manager",
        "gcr.io/k8s-cluster-api/cluster-api-controller:0.1.0",
    );
    let actuator = controller_stateful_set(
        &format!("{provider}-provider-controller-manager"),
        &format!("docker.io/keelci/machine-controller-{provider}:0.1.0"),
    );
    vec![namespace, manager, actuator]
}

fn controller_stateful_set(name: &str, image: &str) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": CLUSTER_API_NAMESPACE,
            "labels": { "control-plane": name },
        },
        "spec": {
            "serviceName": name,
            "replicas": 1,
            "selector": { "matchLabels": { "control-plane": name } },
            "template": {
                "metadata": { "labels": { "control-plane": name } },
                "spec": {
                    "tolerations": [
                        { "key": "node-role.kubernetes.io/master", "effect": "NoSchedule" },
                        { "key": "node.cloudprovider.kubernetes.io/uninitialized", "value": "true", "effect": "NoSchedule" },
                    ],
                    "containers": [{
                        "name": "manager",
                        "image": image,
                        "command": ["/manager"],
                    }],
                },
            },
        },
    })
}

/// Applies CRDs, manager and actuator, then registers the Cluster and
/// its master Machine with the in-cluster cluster-api.
pub async fn install(
    bootstrap: &dyn BootstrapClient,
    cluster: &Cluster,
    master: &Machine,
) -> Result<(), CloudError> {
    tracing::info!(cluster = %cluster.name, "installing cluster-api components");
    for object in crd_objects() {
        bootstrap.apply(object).await?;
    }
    for object in controller_objects(&cluster.spec.config.cloud.cloud_provider) {
        bootstrap.apply(object).await?;
    }
    let namespace = bootstrap.context_namespace();
    bootstrap
        .apply(convert::cluster_object(cluster, &namespace))
        .await?;
    bootstrap
        .apply(convert::machine_object(master, &namespace))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_cover_the_cluster_api_kinds() {
        let names: Vec<String> = crd_objects()
            .iter()
            .map(|o| o["metadata"]["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"machinesets.cluster.k8s.io".to_string()));
        assert!(names.contains(&"clusters.cluster.k8s.io".to_string()));
    }

    #[test]
    fn actuator_image_tracks_the_provider() {
        let objects = controller_objects("digitalocean");
        let actuator = &objects[2];
        let image = actuator["spec"]["template"]["spec"]["containers"][0]["image"]
            .as_str()
            .unwrap();
        assert!(image.contains("digitalocean"));
    }
}

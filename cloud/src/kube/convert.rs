//! Wire form of the cluster-api objects pushed through the bootstrap
//! client. The in-memory model stays ours; these functions produce and
//! consume the `cluster.k8s.io/v1alpha1` JSON shapes.

use serde_json::{Value, json};

use keel_types::{Cluster, Machine, MachineRole, MachineSet, POOL_LABEL};

pub const CLUSTER_API_VERSION: &str = "cluster.k8s.io/v1alpha1";

pub fn machine_set_object(set: &MachineSet, namespace: &str) -> Value {
    let mut labels = set.spec.template.labels.clone();
    labels.insert(POOL_LABEL.to_string(), set.name.clone());
    json!({
        "apiVersion": CLUSTER_API_VERSION,
        "kind": "MachineSet",
        "metadata": {
            "name": set.name,
            "namespace": namespace,
        },
        "spec": {
            "replicas": set.spec.replicas,
            "selector": {
                "matchLabels": { POOL_LABEL: set.name },
            },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "providerSpec": {
                        "value": set.spec.template.spec.provider_spec.value,
                    },
                    "versions": {
                        "kubelet": set.spec.template.spec.versions.kubelet,
                    },
                },
            },
        },
    })
}

pub fn machine_object(machine: &Machine, namespace: &str) -> Value {
    let roles: Vec<String> = machine
        .spec
        .roles
        .iter()
        .map(|r| match r {
            MachineRole::Master => "Master".to_string(),
            MachineRole::Node => "Node".to_string(),
        })
        .collect();
    json!({
        "apiVersion": CLUSTER_API_VERSION,
        "kind": "Machine",
        "metadata": {
            "name": machine.name,
            "namespace": namespace,
            "labels": machine.labels,
        },
        "spec": {
            "roles": roles,
            "providerSpec": {
                "value": machine.spec.provider_spec.value,
            },
            "versions": {
                "kubelet": machine.spec.versions.kubelet,
                "controlPlane": machine.spec.versions.control_plane,
            },
        },
    })
}

pub fn cluster_object(cluster: &Cluster, namespace: &str) -> Value {
    json!({
        "apiVersion": CLUSTER_API_VERSION,
        "kind": "Cluster",
        "metadata": {
            "name": cluster.name,
            "namespace": namespace,
        },
        "spec": {
            "clusterNetwork": {
                "pods": { "cidrBlocks": cluster.spec.cluster_api.cluster_network.pods },
                "services": { "cidrBlocks": cluster.spec.cluster_api.cluster_network.services },
                "serviceDomain": cluster.spec.cluster_api.cluster_network.service_domain,
            },
            "providerSpec": {
                "value": cluster.spec.cluster_api.provider_spec.value,
            },
        },
    })
}

/// Reads back the fields of a MachineSet the engine reconciles against.
pub fn machine_set_from_object(value: &Value) -> Option<MachineSet> {
    let name = value["metadata"]["name"].as_str()?;
    let mut set = MachineSet {
        name: name.to_string(),
        ..Default::default()
    };
    set.spec.replicas = value["spec"]["replicas"].as_i64().unwrap_or(0) as i32;
    if let Some(kubelet) = value["spec"]["template"]["spec"]["versions"]["kubelet"].as_str() {
        set.spec.template.spec.versions.kubelet = kubelet.to_string();
    }
    if let Some(v) = value["spec"]["template"]["spec"]["providerSpec"]["value"].as_object() {
        set.spec.template.spec.provider_spec.value = Some(Value::Object(v.clone()));
    }
    Some(set)
}

pub fn object_coordinates(value: &Value) -> Option<(String, String, String)> {
    Some((
        value["apiVersion"].as_str()?.to_string(),
        value["kind"].as_str()?.to_string(),
        value["metadata"]["name"].as_str()?.to_string(),
    ))
}

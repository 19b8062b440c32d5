//! Cloud-init startup scripts injected as VM user-data. The script
//! installs a kubeadm toolchain at the cluster's Kubernetes version,
//! drops the cloud-controller-manager config at a fixed path, and either
//! initializes the control plane or joins the worker pool.

use keel_types::{Cluster, KUBERNETES_BIND_PORT, Machine};

/// Where the cloud-controller-manager reads its provider config.
pub const CLOUD_CONFIG_PATH: &str = "/etc/kubernetes/ccm/cloud-config";

fn header(cluster: &Cluster, cloud_config: &str) -> String {
    let version = cluster
        .spec
        .config
        .kubernetes_version
        .trim_start_matches('v');
    format!(
        r#"#!/bin/bash
set -euo pipefail

mkdir -p /etc/kubernetes/ccm
cat > {CLOUD_CONFIG_PATH} <<'EOF'
{cloud_config}
EOF

apt-get update
apt-get install -y apt-transport-https curl
curl -fsSL https://packages.cloud.google.com/apt/doc/apt-key.gpg | apt-key add -
echo 'deb https://apt.kubernetes.io/ kubernetes-xenial main' > /etc/apt/sources.list.d/kubernetes.list
apt-get update
apt-get install -y docker.io kubelet={version}-00 kubeadm={version}-00 kubectl={version}-00
"#
    )
}

fn master_tail(cluster: &Cluster) -> String {
    let pod_cidr = cluster
        .spec
        .cluster_api
        .cluster_network
        .pods
        .first()
        .cloned()
        .unwrap_or_default();
    let service_cidr = cluster
        .spec
        .cluster_api
        .cluster_network
        .services
        .first()
        .cloned()
        .unwrap_or_default();
    let mut sans: Vec<String> = cluster.spec.config.api_server_cert_sans.clone();
    for ep in &cluster.spec.cluster_api.status.api_endpoints {
        sans.push(ep.host.clone());
    }
    let san_flags: String = sans
        .iter()
        .map(|san| format!(" --apiserver-cert-extra-sans={san}"))
        .collect();
    format!(
        r#"
kubeadm init \
    --kubernetes-version={version} \
    --pod-network-cidr={pod_cidr} \
    --service-cidr={service_cidr} \
    --apiserver-bind-port={port}{san_flags}
"#,
        version = cluster.spec.config.kubernetes_version,
        port = KUBERNETES_BIND_PORT,
    )
}

fn node_tail(cluster: &Cluster, join_token: &str) -> String {
    let endpoint = cluster
        .spec
        .cluster_api
        .status
        .api_endpoints
        .first()
        .map(|ep| format!("{}:{}", ep.host, ep.port))
        .unwrap_or_default();
    format!(
        r#"
kubeadm join {endpoint} \
    --token {join_token} \
    --discovery-token-unsafe-skip-ca-verification
"#
    )
}

/// Renders the user-data for one machine according to its role set.
pub fn startup_script(
    cluster: &Cluster,
    machine: &Machine,
    cloud_config: &str,
    join_token: &str,
) -> String {
    let mut script = header(cluster, cloud_config);
    if machine.is_master() {
        script.push_str(&master_tail(cluster));
    } else {
        script.push_str(&node_tail(cluster, join_token));
    }
    script
}

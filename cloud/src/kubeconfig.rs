//! In-memory kubeconfig for the provisioned control plane. The same
//! document backs `get_kube_config` and the admin client connection.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use keel_types::Cluster;

use crate::CloudError;
use crate::pki::ClusterPki;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEndpoint,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEndpoint {
    pub server: String,
    pub certificate_authority_data: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NamedUser {
    pub name: String,
    pub user: UserCredentials,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct UserCredentials {
    pub client_certificate_data: String,
    pub client_key_data: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
}

/// Builds an admin kubeconfig: cluster CA as the trust root and a fresh
/// admin client certificate in `system:masters`.
pub fn admin_kubeconfig(cluster: &Cluster, pki: &ClusterPki) -> Result<KubeConfig, CloudError> {
    let server = cluster
        .api_server_url()
        .ok_or_else(|| CloudError::Bootstrap(format!("cluster `{}` has no API endpoint", cluster.name)))?;
    let admin = crate::pki::issue_admin_cert(&pki.ca)?;

    let cluster_entry = format!("{}.keel", cluster.name);
    let user = format!("cluster-admin@{}", cluster.name);
    let context = format!("{}@{}", user, cluster_entry);
    Ok(KubeConfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: cluster_entry.clone(),
            cluster: ClusterEndpoint {
                server,
                certificate_authority_data: BASE64.encode(&pki.ca.cert_pem),
            },
        }],
        users: vec![NamedUser {
            name: user.clone(),
            user: UserCredentials {
                client_certificate_data: BASE64.encode(&admin.cert_pem),
                client_key_data: BASE64.encode(&admin.key_pem),
            },
        }],
        contexts: vec![NamedContext {
            name: context.clone(),
            context: ContextEntry {
                cluster: cluster_entry,
                user,
            },
        }],
        current_context: context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kubeconfig_serializes_with_kubectl_field_names() {
        let config = KubeConfig {
            api_version: "v1".into(),
            kind: "Config".into(),
            clusters: vec![NamedCluster {
                name: "c".into(),
                cluster: ClusterEndpoint {
                    server: "https://203.0.113.10:6443".into(),
                    certificate_authority_data: "Zm9v".into(),
                },
            }],
            users: vec![NamedUser {
                name: "u".into(),
                user: UserCredentials {
                    client_certificate_data: "Zm9v".into(),
                    client_key_data: "YmFy".into(),
                },
            }],
            contexts: vec![NamedContext {
                name: "u@c".into(),
                context: ContextEntry {
                    cluster: "c".into(),
                    user: "u".into(),
                },
            }],
            current_context: "u@c".into(),
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(
            value["clusters"][0]["cluster"]["certificate-authority-data"],
            "Zm9v"
        );
        assert_eq!(value["users"][0]["user"]["client-key-data"], "YmFy");
        assert_eq!(value["current-context"], "u@c");
    }
}

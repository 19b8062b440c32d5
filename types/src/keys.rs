use serde::{Deserialize, Serialize};

/// Well-known certificate pair names under a cluster's pki/ prefix.
pub const CA_NAME: &str = "ca";
pub const FRONT_PROXY_CA_NAME: &str = "front-proxy-ca";
pub const ETCD_CA_NAME: &str = "etcd/ca";
pub const SERVICE_ACCOUNT_KEY_NAME: &str = "sa";

/// PEM certificate + key pair.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct CertBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Cluster SSH key pair as stored and as registered with the cloud.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct SshKey {
    pub private_key_pem: String,

    /// `ssh-rsa AAAA... <comment>` single line.
    pub public_key_openssh: String,

    /// Colon-separated MD5 fingerprint, the format clouds key on.
    pub fingerprint: String,
}

/// Everything needed to shell into a node.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub private_key_pem: String,
}

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeAddressKind {
    InternalIp,
    ExternalIp,
    ExternalDns,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NodeAddress {
    pub kind: NodeAddressKind,
    pub address: String,
}

/// What a connector reports back about a created or inspected VM.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct NodeInfo {
    pub name: String,

    /// Cloud-side instance id.
    pub external_id: String,

    #[serde(default)]
    pub public_ip: String,

    #[serde(default)]
    pub private_ip: String,

    #[serde(default)]
    pub disk_ids: Vec<String>,
}

impl NodeInfo {
    pub fn addresses(&self) -> Vec<NodeAddress> {
        let mut out = Vec::new();
        if !self.private_ip.is_empty() {
            out.push(NodeAddress {
                kind: NodeAddressKind::InternalIp,
                address: self.private_ip.clone(),
            });
        }
        if !self.public_ip.is_empty() {
            out.push(NodeAddress {
                kind: NodeAddressKind::ExternalIp,
                address: self.public_ip.clone(),
            });
        }
        out
    }
}

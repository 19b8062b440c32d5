//! Key layout shared by the object-store backend and the in-memory one.
//!
//! Namespacing is two-level: `owner → cluster-name → resource`.

use crate::{Kind, Scope};

pub fn resource_home(prefix: &str, kind: Kind, scope: &Scope) -> String {
    match kind {
        Kind::Cluster => format!("{}/{}/clusters", prefix, scope.owner),
        Kind::Machine => format!(
            "{}/{}/clusters/{}/machines",
            prefix,
            scope.owner,
            scope.cluster()
        ),
        Kind::MachineSet => format!(
            "{}/{}/clusters/{}/machinesets",
            prefix,
            scope.owner,
            scope.cluster()
        ),
        Kind::Operation => format!("{}/operations", prefix),
        Kind::Credential => format!("{}/credentials", prefix),
    }
}

pub fn resource_key(prefix: &str, kind: Kind, scope: &Scope, name: &str) -> String {
    format!("{}/{}.json", resource_home(prefix, kind, scope), name)
}

pub fn cert_keys(prefix: &str, scope: &Scope, name: &str) -> (String, String) {
    let home = format!(
        "{}/{}/clusters/{}/pki",
        prefix,
        scope.owner,
        scope.cluster()
    );
    (format!("{home}/{name}.crt"), format!("{home}/{name}.key"))
}

pub fn ssh_keys(prefix: &str, scope: &Scope) -> (String, String) {
    let home = format!(
        "{}/{}/clusters/{}/ssh",
        prefix,
        scope.owner,
        scope.cluster()
    );
    (format!("{home}/id_rsa"), format!("{home}/id_rsa.pub"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope {
            owner: "alice".into(),
            cluster: Some("do-1".into()),
        }
    }

    #[test]
    fn cluster_objects_live_under_the_owner() {
        assert_eq!(
            resource_key("keel", Kind::Cluster, &scope(), "do-1"),
            "keel/alice/clusters/do-1.json"
        );
    }

    #[test]
    fn machines_nest_under_their_cluster() {
        assert_eq!(
            resource_key("keel", Kind::Machine, &scope(), "do-1-master"),
            "keel/alice/clusters/do-1/machines/do-1-master.json"
        );
        assert_eq!(
            resource_key("keel", Kind::MachineSet, &scope(), "pool-a"),
            "keel/alice/clusters/do-1/machinesets/pool-a.json"
        );
    }

    #[test]
    fn credentials_are_owner_independent() {
        assert_eq!(
            resource_key("keel", Kind::Credential, &scope(), "do-cred"),
            "keel/credentials/do-cred.json"
        );
    }

    #[test]
    fn pki_and_ssh_layout() {
        assert_eq!(
            cert_keys("keel", &scope(), "etcd/ca"),
            (
                "keel/alice/clusters/do-1/pki/etcd/ca.crt".to_string(),
                "keel/alice/clusters/do-1/pki/etcd/ca.key".to_string()
            )
        );
        assert_eq!(
            ssh_keys("keel", &scope()),
            (
                "keel/alice/clusters/do-1/ssh/id_rsa".to_string(),
                "keel/alice/clusters/do-1/ssh/id_rsa.pub".to_string()
            )
        );
    }
}

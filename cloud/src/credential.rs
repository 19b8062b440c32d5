use keel_types::{Cluster, Credential};

use crate::CloudError;
use crate::context::Context;
use crate::registry;

/// Resolves the cluster's named credential and validates it against the
/// schema its provider declared.
pub async fn load_credential(ctx: &Context, cluster: &Cluster) -> Result<Credential, CloudError> {
    let name = &cluster.spec.config.credential_name;
    if name.is_empty() {
        return Err(CloudError::InvalidCredential {
            name: cluster.name.clone(),
            reason: "cluster has no credential name set".to_string(),
        });
    }
    let credential = match ctx.store().credentials().get(name).await {
        Ok(c) => c,
        Err(e) if e.is_not_found() => {
            return Err(CloudError::InvalidCredential {
                name: name.clone(),
                reason: "credential does not exist".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    let schema = registry::credential_schema(&cluster.spec.config.cloud.cloud_provider)?;
    schema
        .validate(&credential)
        .map_err(|reason| CloudError::InvalidCredential {
            name: name.clone(),
            reason,
        })?;
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::Store;
    use keel_store::mem::MemBackend;
    use keel_types::{CloudSpec, ClusterConfig, ClusterSpec};

    fn cluster(credential_name: &str) -> Cluster {
        Cluster {
            name: "do-1".into(),
            spec: ClusterSpec {
                config: ClusterConfig {
                    credential_name: credential_name.into(),
                    cloud: CloudSpec {
                        cloud_provider: "digitalocean".into(),
                        region: "nyc3".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_credentials_are_invalid() {
        registry::register_builtin();
        let ctx = Context::new(Store::from_backend(MemBackend::new()));
        let err = load_credential(&ctx, &cluster("ghost")).await.unwrap_err();
        assert!(matches!(err, CloudError::InvalidCredential { .. }));
    }

    #[tokio::test]
    async fn schema_violations_name_the_field() {
        registry::register_builtin();
        let ctx = Context::new(Store::from_backend(MemBackend::new()));
        ctx.store()
            .credentials()
            .create(&Credential {
                name: "do-cred".into(),
                provider: "digitalocean".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = load_credential(&ctx, &cluster("do-cred")).await.unwrap_err();
        match err {
            CloudError::InvalidCredential { reason, .. } => assert!(reason.contains("token")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn valid_credentials_load() {
        registry::register_builtin();
        let ctx = Context::new(Store::from_backend(MemBackend::new()));
        let mut credential = Credential {
            name: "do-cred".into(),
            provider: "digitalocean".into(),
            ..Default::default()
        };
        credential
            .data
            .insert("token".to_string(), "abc123".to_string());
        ctx.store().credentials().create(&credential).await.unwrap();
        let loaded = load_credential(&ctx, &cluster("do-cred")).await.unwrap();
        assert_eq!(loaded.name, "do-cred");
    }
}

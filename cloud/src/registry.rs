//! Process-wide provider registry: provider id → manager factory plus
//! the credential schema the provider declares.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use keel_types::CredentialSchema;

use crate::CloudError;
use crate::context::Context;
use crate::manager::ClusterManager;

type Factory = Arc<dyn Fn(&Context) -> Result<Arc<dyn ClusterManager>, CloudError> + Send + Sync>;

#[derive(Clone)]
struct ProviderEntry {
    factory: Factory,
    schema: CredentialSchema,
}

fn registry() -> &'static RwLock<HashMap<String, ProviderEntry>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, ProviderEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Called once per provider at startup. Re-registration replaces the
/// previous entry, which keeps tests simple.
pub fn register<F>(id: &str, schema: CredentialSchema, factory: F)
where
    F: Fn(&Context) -> Result<Arc<dyn ClusterManager>, CloudError> + Send + Sync + 'static,
{
    registry().write().expect("provider registry poisoned").insert(
        id.to_string(),
        ProviderEntry {
            factory: Arc::new(factory),
            schema,
        },
    );
}

/// Registers every in-tree provider.
pub fn register_builtin() {
    crate::providers::digitalocean::register();
    crate::providers::gce::register();
}

pub fn new_cluster_manager(
    ctx: &Context,
    provider: &str,
) -> Result<Arc<dyn ClusterManager>, CloudError> {
    let entry = registry()
        .read()
        .expect("provider registry poisoned")
        .get(provider)
        .cloned()
        .ok_or_else(|| CloudError::UnknownProvider(provider.to_string()))?;
    (entry.factory)(ctx)
}

pub fn credential_schema(provider: &str) -> Result<CredentialSchema, CloudError> {
    registry()
        .read()
        .expect("provider registry poisoned")
        .get(provider)
        .map(|e| e.schema.clone())
        .ok_or_else(|| CloudError::UnknownProvider(provider.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_providers_are_rejected() {
        let err = credential_schema("skynet").unwrap_err();
        assert!(matches!(err, CloudError::UnknownProvider(p) if p == "skynet"));
    }

    #[test]
    fn builtin_providers_resolve() {
        register_builtin();
        assert_eq!(credential_schema("digitalocean").unwrap().provider, "digitalocean");
        assert_eq!(credential_schema("gce").unwrap().provider, "gce");
    }
}

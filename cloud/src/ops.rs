//! Top-level cluster operations the dispatcher and CLI drive.

use keel_types::{Action, Cluster, ClusterPhase, Machine, MachineRole, MachineSpec,
    MachineVersions, master_machine};

use crate::context::Context;
use crate::error::ignore_already_exists;
use crate::{CloudError, credential, pki, registry, sshkey};

/// Loads credential and key material for a cluster into a fresh context
/// copy. Lazily generates anything that does not exist yet.
pub async fn prepare(ctx: &Context, cluster: &Cluster) -> Result<Context, CloudError> {
    let credential = credential::load_credential(ctx, cluster).await?;
    let pki = pki::ensure_pki(ctx.store(), &cluster.name).await?;
    let ssh_key = sshkey::ensure_ssh_key(ctx.store(), &cluster.name).await?;
    Ok(ctx
        .with_credential(credential)
        .with_pki(pki)
        .with_ssh_key(ssh_key))
}

/// First-contact setup for a cluster record: provider defaults, key
/// material, and the master Machine. Safe to repeat.
pub async fn create_cluster(ctx: &Context, name: &str) -> Result<Cluster, CloudError> {
    let mut cluster = ctx.store().clusters().get(name).await?;
    let manager = registry::new_cluster_manager(ctx, &cluster.spec.config.cloud.cloud_provider)?;
    manager.set_defaults(&mut cluster).await?;
    let cluster = ctx.store().clusters().update(&cluster).await?;

    pki::ensure_pki(ctx.store(), &cluster.name).await?;
    sshkey::ensure_ssh_key(ctx.store(), &cluster.name).await?;

    let machines = ctx.store().machines(&cluster.name).list().await?;
    if master_machine(&machines).is_none() {
        let version = cluster.spec.config.kubernetes_version.clone();
        let master = Machine {
            name: cluster.master_machine_name(),
            cluster_name: cluster.name.clone(),
            spec: MachineSpec {
                roles: vec![MachineRole::Master],
                provider_spec: manager.get_default_machine_provider_spec(
                    &cluster,
                    "",
                    MachineRole::Master,
                )?,
                versions: MachineVersions {
                    control_plane: version.clone(),
                    kubelet: version,
                },
            },
            ..Default::default()
        };
        ignore_already_exists(
            ctx.store()
                .machines(&cluster.name)
                .create(&master)
                .await
                .map_err(CloudError::from),
        )?;
        tracing::info!(cluster = %cluster.name, machine = %master.name, "registered master machine");
    }
    Ok(cluster)
}

/// One reconciliation pass. On failure the error lands in
/// `status.reason` and the phase is left for the next retry.
pub async fn apply(ctx: &Context, name: &str, dry_run: bool) -> Result<Vec<Action>, CloudError> {
    let cluster = ctx.store().clusters().get(name).await?;
    if cluster.status.phase == ClusterPhase::Deleted {
        return Ok(Vec::new());
    }
    let prepared = prepare(ctx, &cluster).await?;
    let manager =
        registry::new_cluster_manager(&prepared, &cluster.spec.config.cloud.cloud_provider)?;
    match manager.apply(cluster.clone(), dry_run).await {
        Ok(actions) => {
            prepared.notify(&cluster, "apply complete", None).await;
            Ok(actions)
        }
        Err(e) => {
            tracing::error!(cluster = name, error = %e, "apply failed");
            if !dry_run {
                record_failure(&prepared, name, &e).await;
            }
            prepared
                .notify(&cluster, "apply failed", Some(&e.to_string()))
                .await;
            Err(e)
        }
    }
}

async fn record_failure(ctx: &Context, name: &str, error: &CloudError) {
    let Ok(mut cluster) = ctx.store().clusters().get(name).await else {
        return;
    };
    cluster.status.reason = error.to_string();
    if let Err(e) = ctx.store().clusters().update_status(&cluster).await {
        tracing::warn!(cluster = name, error = %e, "failed to record apply failure");
    }
}

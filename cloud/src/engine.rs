//! Provider-independent apply sub-routines. Providers keep their own
//! phase machines and cloud steps; the parts that only touch the store
//! and the provisioned control plane live here as free functions.

use keel_store::Store;
use keel_types::{Action, Cluster, ClusterPhase, MachineSet};

use crate::CloudError;
use crate::error::ignore_not_found;
use crate::kube::{self, AdminClient, BootstrapClient, convert};
use crate::plan;

/// Syncs persisted MachineSets into the bootstrap cluster: deletion
/// timestamps remove, known names patch, new names create. Worker VMs
/// are the in-cluster actuator's job, never created here. `bootstrap`
/// may be `None` only on a dry run.
pub async fn sync_machine_sets(
    store: &Store,
    cluster: &Cluster,
    sets: Vec<MachineSet>,
    dry_run: bool,
    actions: &mut Vec<Action>,
    bootstrap: Option<&dyn BootstrapClient>,
) -> Result<(), CloudError> {
    if sets.is_empty() {
        return Ok(());
    }
    if dry_run {
        for set in &sets {
            if set.deletion_timestamp.is_some() {
                actions.push(Action::delete(
                    "MachineSet",
                    format!("machine set {} will be removed", set.name),
                ));
            } else {
                actions.push(Action::update(
                    "MachineSet",
                    format!("machine set {} will be synced", set.name),
                ));
            }
        }
        return Ok(());
    }

    let bootstrap = bootstrap
        .ok_or_else(|| CloudError::Bootstrap("no bootstrap client for scale".to_string()))?;
    let namespace = bootstrap.context_namespace();
    let existing = bootstrap.get_machine_sets().await?;
    for set in sets {
        if set.deletion_timestamp.is_some() {
            actions.push(Action::delete(
                "MachineSet",
                format!("machine set {} removed", set.name),
            ));
            bootstrap
                .delete(convert::machine_set_object(&set, &namespace))
                .await?;
            ignore_not_found(
                store
                    .machine_sets(&cluster.name)
                    .delete(&set.name)
                    .await
                    .map_err(CloudError::from),
            )?;
            continue;
        }
        match existing.iter().find(|e| e.name == set.name) {
            Some(observed)
                if observed.spec.replicas == set.spec.replicas
                    && observed.spec.template.spec.versions.kubelet
                        == set.spec.template.spec.versions.kubelet =>
            {
                actions.push(Action::nop(
                    "MachineSet",
                    format!("machine set {} in sync", set.name),
                ));
            }
            Some(_) => {
                actions.push(Action::update(
                    "MachineSet",
                    format!("machine set {} updated", set.name),
                ));
                bootstrap
                    .apply(convert::machine_set_object(&set, &namespace))
                    .await?;
            }
            None => {
                actions.push(Action::add(
                    "MachineSet",
                    format!("machine set {} created", set.name),
                ));
                bootstrap
                    .create_machine_sets(std::slice::from_ref(&set), &namespace)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Rolls the control plane to the spec version, waits for it to settle,
/// then rolls every pool template. `clients` may be `None` only on a
/// dry run.
pub async fn roll_cluster_version(
    store: &Store,
    cluster: &mut Cluster,
    dry_run: bool,
    actions: &mut Vec<Action>,
    clients: Option<(&dyn BootstrapClient, &dyn AdminClient)>,
) -> Result<(), CloudError> {
    let target = cluster.spec.config.kubernetes_version.clone();
    actions.push(Action::update(
        "MasterInstance",
        format!("master will be upgraded to {target}"),
    ));
    let sets = store.machine_sets(&cluster.name).list().await?;
    for set in &sets {
        actions.push(Action::update(
            "MachineSet",
            format!("machine set {} will be upgraded to {target}", set.name),
        ));
    }
    if dry_run {
        return Ok(());
    }
    let (bootstrap, admin) = clients
        .ok_or_else(|| CloudError::Bootstrap("no clients for upgrade".to_string()))?;

    let mut master = store
        .machines(&cluster.name)
        .get(&cluster.master_machine_name())
        .await?;
    master.spec.versions.control_plane = target.clone();
    master.spec.versions.kubelet = target.clone();
    let master = store.machines(&cluster.name).update(&master).await?;

    let namespace = bootstrap.context_namespace();
    bootstrap
        .apply(convert::machine_object(&master, &namespace))
        .await?;

    kube::wait_for_master_version(admin, &plan::parse_kubelet_version(&target)?).await?;
    kube::wait_for_ready_master(admin).await?;

    for mut set in sets {
        set.spec.template.spec.versions.kubelet = target.clone();
        let set = store.machine_sets(&cluster.name).update(&set).await?;
        bootstrap
            .apply(convert::machine_set_object(&set, &namespace))
            .await?;
    }

    cluster.status.phase = ClusterPhase::Ready;
    cluster.status.reason.clear();
    *cluster = store.clusters().update_status(cluster).await?;
    Ok(())
}

/// Sets every pool's desired replicas to zero ahead of a teardown.
pub async fn zero_machine_set_replicas(
    store: &Store,
    cluster: &Cluster,
) -> Result<(), CloudError> {
    let sets = store.machine_sets(&cluster.name).list().await?;
    for mut set in sets {
        if set.spec.replicas != 0 {
            set.spec.replicas = 0;
            store.machine_sets(&cluster.name).update(&set).await?;
        }
    }
    Ok(())
}

//! Pure routing: which apply sub-routines run for a cluster in a given
//! state. Keeping this a plain function keeps every provider's `apply`
//! on the same phase machine.

use keel_types::ClusterPhase;

use crate::CloudError;
use crate::kube::NodeStatus;

/// The sub-routines one `apply` pass will run, in fixed order:
/// create → zero replicas → scale → upgrade → delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    pub create: bool,
    pub zero_replicas: bool,
    pub scale: bool,
    pub upgrade: bool,
    pub delete: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PlanError {
    UnknownPhase,
    UpgradeInProgress,
}

impl PlanError {
    pub fn into_cloud_error(self, cluster: &str) -> CloudError {
        match self {
            PlanError::UnknownPhase => CloudError::PhaseConflict {
                cluster: cluster.to_string(),
                conflict: ClusterPhase::Unknown,
                reason: "cluster is in unknown phase".to_string(),
            },
            PlanError::UpgradeInProgress => CloudError::PhaseConflict {
                cluster: cluster.to_string(),
                conflict: ClusterPhase::Upgrading,
                reason: "cluster is upgrading, retry after it returns to Ready".to_string(),
            },
        }
    }
}

pub fn route(
    phase: ClusterPhase,
    deletion_requested: bool,
    upgrade_requested: bool,
) -> Result<ApplyPlan, PlanError> {
    match phase {
        ClusterPhase::Unknown => Err(PlanError::UnknownPhase),
        ClusterPhase::Upgrading => Err(PlanError::UpgradeInProgress),
        ClusterPhase::Deleted => Ok(ApplyPlan::default()),
        ClusterPhase::Ready if upgrade_requested => Ok(ApplyPlan {
            upgrade: true,
            ..Default::default()
        }),
        ClusterPhase::Ready | ClusterPhase::Pending => Ok(ApplyPlan {
            create: phase == ClusterPhase::Pending,
            zero_replicas: deletion_requested,
            scale: true,
            delete: deletion_requested,
            ..Default::default()
        }),
        ClusterPhase::Deleting => Ok(ApplyPlan {
            zero_replicas: deletion_requested,
            scale: true,
            delete: true,
            ..Default::default()
        }),
    }
}

/// `v1.13.4` → semver. Kubelets report a leading `v`.
pub fn parse_kubelet_version(version: &str) -> Result<semver::Version, CloudError> {
    semver::Version::parse(version.trim_start_matches('v'))
        .map_err(|e| CloudError::InvalidSpec(format!("bad kubernetes version `{version}`: {e}")))
}

/// An upgrade is requested when any initialized node runs a kubelet
/// older than the spec version.
pub fn upgrade_requested(nodes: &[NodeStatus], target: &str) -> Result<bool, CloudError> {
    let target = parse_kubelet_version(target)?;
    for node in nodes {
        if node.uninitialized || node.kubelet_version.is_empty() {
            continue;
        }
        if parse_kubelet_version(&node.kubelet_version)? < target {
            return Ok(true);
        }
    }
    Ok(false)
}

//! `check` command
//!
//! Reports whether a policy is usable and which of its workloads carry the
//! backup component.

use tracing::info;

use crate::admission;
use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::sidecar;
use crate::workload::{applied_policy, saved_replicas, WorkloadKind, WorkloadRef};

/// Inputs of the `check` command
#[derive(Clone, Debug, Default)]
pub struct CheckOptions {
    pub policy_name: String,
    pub namespace: String,
    pub host_name: Option<String>,
    pub smart_prefix: Option<String>,
}

/// State of one selected workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadCheck {
    pub target: WorkloadRef,
    /// Carries the component and is marked with this policy
    pub injected: bool,
    /// Has a saved replica count waiting to be restored
    pub restore_pending: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckReport {
    pub repository_prefix: String,
    pub workloads: Vec<WorkloadCheck>,
}

/// Repository path backups of a host are written under
pub fn repository_prefix(smart_prefix: Option<&str>, host_name: Option<&str>) -> String {
    [smart_prefix, host_name]
        .into_iter()
        .flatten()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate the policy and inspect every workload it selects.
///
/// A missing or invalid policy is an error.
pub async fn run(gateway: &dyn ClusterGateway, options: &CheckOptions) -> Result<CheckReport> {
    let policy = gateway
        .get_policy(&options.namespace, &options.policy_name)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "BackupPolicy {}/{}",
                options.namespace, options.policy_name
            ))
        })?;
    let selector = admission::validate(&policy)?;
    let query = selector.to_string();

    let mut workloads = Vec::new();
    for kind in WorkloadKind::ALL {
        for workload in gateway
            .list_workloads(kind, Some(&options.namespace), &query)
            .await?
        {
            if workload.is_owned_by_deployment() {
                continue;
            }
            let marked = applied_policy(&workload)
                .ok()
                .flatten()
                .is_some_and(|m| m.refers_to(&options.namespace, &options.policy_name));
            let check = WorkloadCheck {
                target: workload.reference(),
                injected: marked && sidecar::has_sidecar(workload.pod_template()),
                restore_pending: !matches!(saved_replicas(&workload), Ok(None)),
            };
            info!(
                workload = %check.target,
                injected = check.injected,
                restore_pending = check.restore_pending,
                "Checked workload"
            );
            workloads.push(check);
        }
    }

    let repository_prefix = repository_prefix(
        options.smart_prefix.as_deref(),
        options.host_name.as_deref(),
    );
    info!(
        policy = %options.policy_name,
        repository = %repository_prefix,
        workloads = workloads.len(),
        "BackupPolicy is valid"
    );

    Ok(CheckReport {
        repository_prefix,
        workloads,
    })
}

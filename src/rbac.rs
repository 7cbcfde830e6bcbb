//! Access grants for injected components and the scale-down job

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info};

use crate::error::Result;
use crate::gateway::ClusterGateway;
use crate::workload::WorkloadKind;

/// Cluster role bound to every injected component
pub const SIDECAR_CLUSTER_ROLE: &str = "backup-sidecar";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const MAX_NAME_LEN: usize = 63;

/// Verbs needed to read and write workloads. Workload writes go through a
/// full object replace, which the API server authorizes as `update`.
pub const WORKLOAD_WRITE_VERBS: &[&str] = &["get", "list", "patch", "update"];

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_string(),
        "workload-backup-operator".to_string(),
    )])
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

/// Deterministic role binding name for a workload's grant.
///
/// Lower-cased `backup-sidecar-<kind>-<name>`. Names that do not fit in 63
/// characters are shortened by [`bounded_name`].
pub fn grant_name(kind: WorkloadKind, name: &str) -> String {
    let full = format!(
        "{}-{}-{}",
        SIDECAR_CLUSTER_ROLE,
        kind.as_str().to_ascii_lowercase(),
        name
    )
    .to_ascii_lowercase();
    bounded_name(&full, MAX_NAME_LEN)
}

/// `full` if it is at most `max` characters long. Otherwise a prefix of
/// `full` followed by `-` and eight hex digits of an FNV-1a hash of the
/// whole of `full`, so that distinct long names stay distinct.
pub fn bounded_name(full: &str, max: usize) -> String {
    if full.len() <= max {
        return full.to_string();
    }

    let hash = full.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    });
    let suffix = format!("{:016x}", hash);

    let mut prefix: String = full.chars().take(max.saturating_sub(9)).collect();
    while prefix.ends_with(['-', '.']) {
        prefix.pop();
    }
    format!("{}-{}", prefix, &suffix[..8])
}

/// Ensure the grant for the component injected into `owner`.
///
/// The binding is owned by the workload, so it is garbage collected with it.
pub async fn ensure_grant(
    gateway: &dyn ClusterGateway,
    owner: &OwnerReference,
    namespace: &str,
    service_account: &str,
) -> Result<()> {
    let kind: WorkloadKind = owner.kind.parse()?;
    let name = grant_name(kind, &owner.name);
    let binding = RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: SIDECAR_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    };

    gateway.apply_role_binding(&binding).await?;
    debug!(namespace = %namespace, binding = %name, "Ensured sidecar role binding");
    Ok(())
}

/// Remove the grant of a workload. A grant that is already gone is success.
pub async fn retract_grant(
    gateway: &dyn ClusterGateway,
    kind: WorkloadKind,
    name: &str,
    namespace: &str,
) -> Result<()> {
    let binding = grant_name(kind, name);
    if gateway.delete_role_binding(namespace, &binding).await? {
        info!(namespace = %namespace, binding = %binding, "Deleted sidecar role binding");
    }
    Ok(())
}

/// Provision the cluster role bound by every grant
pub async fn ensure_sidecar_cluster_role(gateway: &dyn ClusterGateway) -> Result<()> {
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(SIDECAR_CLUSTER_ROLE.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        rules: Some(vec![
            rule(&["backup.oso.sh"], &["*"], &["get", "list", "watch"]),
            rule(
                &["apps"],
                &["deployments", "replicasets", "statefulsets", "daemonsets"],
                WORKLOAD_WRITE_VERBS,
            ),
            rule(&[""], &["replicationcontrollers"], WORKLOAD_WRITE_VERBS),
            rule(&[""], &["pods", "secrets"], &["get"]),
            rule(&[""], &["events"], &["create"]),
        ]),
        aggregation_rule: None,
    };
    gateway.apply_cluster_role(&role).await?;
    info!(role = SIDECAR_CLUSTER_ROLE, "Ensured sidecar cluster role");
    Ok(())
}

/// Service account, role and binding the scale-down job runs as.
///
/// All three are named after the job and owned by `owner`.
pub async fn ensure_scaledown_job_rbac(
    gateway: &dyn ClusterGateway,
    owner: &OwnerReference,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels()),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    };

    gateway
        .apply_service_account(&ServiceAccount {
            metadata: meta.clone(),
            ..Default::default()
        })
        .await?;

    gateway
        .apply_role(&Role {
            metadata: meta.clone(),
            rules: Some(vec![
                rule(&["apps"], &["deployments", "replicasets"], WORKLOAD_WRITE_VERBS),
                rule(&[""], &["replicationcontrollers"], WORKLOAD_WRITE_VERBS),
                rule(&[""], &["pods"], &["list", "delete"]),
            ]),
        })
        .await?;

    gateway
        .apply_role_binding(&RoleBinding {
            metadata: meta,
            role_ref: RoleRef {
                api_group: RBAC_GROUP.to_string(),
                kind: "Role".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
        })
        .await?;

    debug!(namespace = %namespace, job = %name, "Ensured scale-down job RBAC");
    Ok(())
}

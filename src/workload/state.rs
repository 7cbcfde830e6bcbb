//! Controller state persisted on workloads as annotations
//!
//! The operator keeps nothing in memory that must survive a restart. The
//! replica count a workload had before a scale-down, and the policy that
//! caused a sidecar injection, are written back onto the workload itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crd::{BackupPolicy, BackupPolicySpec};
use crate::error::{Error, Result};
use crate::workload::Workload;

/// Replica count observed before the scale-down that is still owed a restore
pub const PREVIOUS_REPLICA_COUNT: &str = "backup.oso.sh/previous-replica-count";

/// Time at which the replica count above was recorded
pub const SCALED_DOWN_AT: &str = "backup.oso.sh/scaled-down-at";

/// Policy that caused the backup component to be injected
pub const APPLIED_POLICY: &str = "backup.oso.sh/applied-policy";

/// Read the saved replica count.
///
/// `Ok(None)` is the steady state. A value that is not an integer is an
/// error rather than silently treated as absent, so a restore never guesses.
pub fn saved_replicas(workload: &Workload) -> Result<Option<i32>> {
    match workload.annotation(PREVIOUS_REPLICA_COUNT) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|e| Error::invalid_annotation(PREVIOUS_REPLICA_COUNT, format!("'{}': {}", raw, e))),
    }
}

/// When the saved replica count was recorded, if known
pub fn scaled_down_at(workload: &Workload) -> Option<DateTime<Utc>> {
    workload
        .annotation(SCALED_DOWN_AT)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Record the current replica count unless one is already saved.
///
/// Postcondition: the annotation holds the count from before the *first*
/// scale-down of this cycle. Returns the saved value, or `None` for kinds
/// without a replica count.
pub fn save_replicas(workload: &mut Workload, now: DateTime<Utc>) -> Result<Option<i32>> {
    if let Some(existing) = saved_replicas(workload)? {
        workload.set_annotation(SCALED_DOWN_AT, now.to_rfc3339());
        return Ok(Some(existing));
    }
    let Some(current) = workload.replicas() else {
        return Ok(None);
    };
    workload.set_annotation(PREVIOUS_REPLICA_COUNT, current.to_string());
    workload.set_annotation(SCALED_DOWN_AT, now.to_rfc3339());
    Ok(Some(current))
}

/// Remove the saved replica state, returning the saved count.
///
/// Postcondition: neither annotation is present.
pub fn take_saved_replicas(workload: &mut Workload) -> Result<Option<i32>> {
    let saved = saved_replicas(workload)?;
    workload.remove_annotation(PREVIOUS_REPLICA_COUNT);
    workload.remove_annotation(SCALED_DOWN_AT);
    Ok(saved)
}

/// Record of the policy a workload was last reconciled against
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedPolicy {
    pub namespace: String,
    pub name: String,
    pub spec: BackupPolicySpec,
}

impl AppliedPolicy {
    pub fn from_policy(policy: &BackupPolicy) -> Self {
        Self {
            namespace: policy
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: policy.metadata.name.clone().unwrap_or_default(),
            spec: policy.spec.clone(),
        }
    }

    pub fn refers_to(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

/// Read the injection marker. Malformed markers are reported as errors so
/// the caller can raise a warning against the workload.
pub fn applied_policy(workload: &Workload) -> Result<Option<AppliedPolicy>> {
    workload
        .annotation(APPLIED_POLICY)
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| Error::invalid_annotation(APPLIED_POLICY, e.to_string()))
        })
        .transpose()
}

pub fn set_applied_policy(workload: &mut Workload, applied: &AppliedPolicy) -> Result<()> {
    let encoded = serde_json::to_string(applied)?;
    workload.set_annotation(APPLIED_POLICY, encoded);
    Ok(())
}

pub fn clear_applied_policy(workload: &mut Workload) {
    workload.remove_annotation(APPLIED_POLICY);
}

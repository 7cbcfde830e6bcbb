//! BackupPolicy reconciler
//!
//! Handles:
//! - Validation, with the policy marked Invalid when it fails
//! - The scale-down job of offline policies
//! - Fanning out to every workload the policy selects or used to select
//! - Status updates
//!
//! Workloads themselves are only ever changed by the workload reconciler.

use std::collections::BTreeSet;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::admission;
use crate::controllers::Context;
use crate::crd::{BackupPolicy, BackupPolicyStatus, BackupType, Condition};
use crate::error::Result;
use crate::events::REASON_INVALID_POLICY;
use crate::queue::{Action, ObjectKey};
use crate::reconcilers::cronjob;
use crate::selector::{self, Selector};
use crate::sidecar;
use crate::workload::{applied_policy, saved_replicas, AppliedPolicy, Workload, WorkloadRef};

pub const PHASE_READY: &str = "Ready";
pub const PHASE_INVALID: &str = "Invalid";

/// Reconcile one policy key against the watch caches
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action> {
    let Some(policy) = ctx.policies.get(key) else {
        return handle_deletion(key, ctx).await;
    };

    let selector = match admission::validate(&policy) {
        Ok(selector) => selector,
        Err(e) => {
            warn!(error = %e, "Validation failed");
            ctx.recorder.warning(
                &format!("BackupPolicy/{}", key),
                REASON_INVALID_POLICY,
                &e.to_string(),
            );
            update_status_invalid(&policy, ctx, &e.to_string()).await?;
            return Ok(Action::await_change());
        }
    };

    match policy.spec.backup_type {
        BackupType::Offline => cronjob::ensure(ctx, &policy, &selector).await?,
        BackupType::Online => cronjob::remove(ctx, &policy).await?,
    }

    let fan_out = plan_fan_out(&policy, &selector, ctx);
    for target in &fan_out.enqueue {
        ctx.workload_queue.push(target.clone()).await;
    }
    info!(
        matched = fan_out.matched,
        enqueued = fan_out.enqueue.len(),
        "Reconciled BackupPolicy"
    );

    update_status_ready(&policy, ctx, fan_out.matched).await?;
    Ok(Action::await_change())
}

/// Workloads a policy pass hands to the workload reconciler
#[derive(Debug, Default, PartialEq)]
pub struct FanOut {
    /// Workloads currently selected by the policy
    pub matched: u32,
    pub enqueue: BTreeSet<WorkloadRef>,
}

/// Decide which cached workloads need a pass.
///
/// Selected workloads that already carry this policy's component and owe
/// no restore are skipped. Workloads still marked with this policy that no
/// longer match are included so their component is removed.
pub fn plan_fan_out(policy: &BackupPolicy, selector: &Selector, ctx: &Context) -> FanOut {
    let namespace = policy.namespace().unwrap_or_default();
    let name = policy.name_any();
    let applied = AppliedPolicy::from_policy(policy);
    let mut fan_out = FanOut::default();

    for workload in ctx.workloads.list(|w| w.namespace() == namespace) {
        let marker = applied_policy(&workload).ok().flatten();
        if selector::matches(selector, workload.labels()) {
            if workload.is_owned_by_deployment() {
                continue;
            }
            fan_out.matched += 1;
            if !is_up_to_date(&workload, &applied, marker.as_ref()) {
                fan_out.enqueue.insert(workload.reference());
            }
        } else if marker.is_some_and(|m| m.refers_to(&namespace, &name)) {
            fan_out.enqueue.insert(workload.reference());
        }
    }

    fan_out
}

fn is_up_to_date(workload: &Workload, applied: &AppliedPolicy, marker: Option<&AppliedPolicy>) -> bool {
    marker == Some(applied)
        && sidecar::has_sidecar(workload.pod_template())
        && matches!(saved_replicas(workload), Ok(None))
}

/// The policy is gone: every workload whose marker references it gets a
/// pass, which removes the component unless another policy now applies.
async fn handle_deletion(key: &ObjectKey, ctx: &Context) -> Result<Action> {
    let orphans: Vec<WorkloadRef> = ctx
        .workloads
        .list(|w| {
            applied_policy(w)
                .ok()
                .flatten()
                .is_some_and(|m| m.refers_to(&key.namespace, &key.name))
        })
        .iter()
        .map(|w| w.reference())
        .collect();

    info!(workloads = orphans.len(), "BackupPolicy deleted, releasing workloads");
    for target in orphans {
        debug!(workload = %target, "Enqueueing workload of deleted policy");
        ctx.workload_queue.push(target).await;
    }
    Ok(Action::await_change())
}

/// Update status to Ready
async fn update_status_ready(policy: &BackupPolicy, ctx: &Context, matched: u32) -> Result<()> {
    let message = format!("Selecting {} workload(s)", matched);
    let status = BackupPolicyStatus {
        phase: Some(PHASE_READY.to_string()),
        message: Some(message.clone()),
        matched_workloads: Some(matched),
        observed_generation: policy.metadata.generation,
        conditions: vec![ready_condition(policy, "True", "PolicyValid", message)],
    };
    patch_status(policy, ctx, status).await
}

/// Update status to Invalid
async fn update_status_invalid(policy: &BackupPolicy, ctx: &Context, error_message: &str) -> Result<()> {
    let status = BackupPolicyStatus {
        phase: Some(PHASE_INVALID.to_string()),
        message: Some(error_message.to_string()),
        matched_workloads: None,
        observed_generation: policy.metadata.generation,
        conditions: vec![ready_condition(
            policy,
            "False",
            "ValidationFailed",
            error_message.to_string(),
        )],
    };
    patch_status(policy, ctx, status).await
}

/// The Ready condition, keeping the previous transition time while its
/// status stays the same
fn ready_condition(policy: &BackupPolicy, status: &str, reason: &str, message: String) -> Condition {
    let last_transition_time = policy
        .status
        .iter()
        .flat_map(|s| s.conditions.iter())
        .find(|c| c.type_ == "Ready" && c.status == status)
        .map(|c| c.last_transition_time)
        .unwrap_or_else(Utc::now);

    Condition {
        type_: "Ready".to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason.to_string()),
        message: Some(message),
    }
}

async fn patch_status(policy: &BackupPolicy, ctx: &Context, status: BackupPolicyStatus) -> Result<()> {
    let namespace = policy.namespace().unwrap_or_default();
    ctx.gateway
        .patch_policy_status(&namespace, &policy.name_any(), &status)
        .await
}

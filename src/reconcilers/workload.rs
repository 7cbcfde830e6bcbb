//! Workload reconciler
//!
//! Brings one workload in line with the policies of its namespace: restores
//! replica counts left behind by an interrupted scale run, then injects or
//! removes the backup component and its access grant.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::admission;
use crate::controllers::Context;
use crate::crd::BackupPolicy;
use crate::error::Result;
use crate::events::{
    REASON_INVALID_MARKER, REASON_MULTIPLE_POLICIES, REASON_POD_RESTART_FAILED,
    REASON_REPLICAS_RESTORED, REASON_SIDECAR_INJECTED, REASON_SIDECAR_REMOVED,
};
use crate::metrics;
use crate::queue::{Action, ObjectKey};
use crate::rbac;
use crate::scale::{self, RestoreOutcome};
use crate::selector;
use crate::sidecar;
use crate::workload::{
    applied_policy, clear_applied_policy, saved_replicas, scaled_down_at, set_applied_policy,
    AppliedPolicy, Workload, WorkloadRef,
};

/// What the policies of the namespace ask of a workload
#[derive(Debug)]
pub enum Desired {
    /// Exactly one valid policy selects the workload
    Policy(Arc<BackupPolicy>),
    /// No valid policy selects the workload
    Nothing,
    /// More than one valid policy selects the workload
    Ambiguous(Vec<String>),
}

/// Find the policy that should apply to `workload`
pub fn desired_policy(workload: &Workload, ctx: &Context) -> Desired {
    let namespace = workload.namespace();
    let mut matching: Vec<Arc<BackupPolicy>> = ctx.policies.list(|p| {
        p.namespace().as_deref() == Some(namespace)
            && admission::validate(p)
                .map(|compiled| selector::matches(&compiled, workload.labels()))
                .unwrap_or(false)
    });

    match matching.len() {
        0 => Desired::Nothing,
        1 => Desired::Policy(matching.remove(0)),
        _ => {
            let mut names: Vec<String> = matching.iter().map(|p| p.name_any()).collect();
            names.sort();
            Desired::Ambiguous(names)
        }
    }
}

/// Reconcile one workload key against the watch caches
pub async fn reconcile(key: &WorkloadRef, ctx: &Context) -> Result<Action> {
    let Some(workload) = ctx.workloads.get(key) else {
        return Ok(Action::await_change());
    };
    if workload.is_owned_by_deployment() {
        return Ok(Action::await_change());
    }

    if let Some(action) = restore_if_due(key, &workload, ctx).await? {
        return Ok(action);
    }

    let object = key.to_string();
    let (marker, marker_malformed) = match applied_policy(&workload) {
        Ok(marker) => (marker, false),
        Err(e) => {
            ctx.recorder
                .warning(&object, REASON_INVALID_MARKER, &e.to_string());
            (None, true)
        }
    };

    // A marker pointing at a policy that still exists but no longer
    // validates leaves the workload as it is until the policy is fixed.
    if let Some(m) = &marker {
        let marker_key = ObjectKey::new(m.namespace.clone(), m.name.clone());
        if let Some(policy) = ctx.policies.get(&marker_key) {
            if admission::validate(&policy).is_err() {
                debug!(policy = %marker_key, "Applied policy is invalid, leaving workload untouched");
                return Ok(Action::await_change());
            }
        }
    }

    let has_sidecar = sidecar::has_sidecar(workload.pod_template());

    match desired_policy(&workload, ctx) {
        Desired::Ambiguous(names) => {
            ctx.recorder.warning(
                &object,
                REASON_MULTIPLE_POLICIES,
                &format!("selected by more than one BackupPolicy: {}", names.join(", ")),
            );
            Ok(Action::await_change())
        }
        Desired::Policy(policy) => {
            // The binding follows the template's service account on every
            // pass; applying an unchanged binding is a no-op.
            rbac::ensure_grant(
                ctx.gateway.as_ref(),
                &workload.owner_reference()?,
                &key.namespace,
                &workload.service_account(),
            )
            .await?;

            let applied = AppliedPolicy::from_policy(&policy);
            if has_sidecar && marker.as_ref() == Some(&applied) {
                return Ok(Action::await_change());
            }
            vanished(inject(key, &policy, applied, ctx).await)?;
            Ok(Action::await_change())
        }
        Desired::Nothing => {
            if has_sidecar || marker.is_some() || marker_malformed {
                vanished(remove(key, &workload, ctx).await)?;
            }
            Ok(Action::await_change())
        }
    }
}

/// A workload deleted between the cache read and the write needs no
/// further pass; its delete event already cleared it from the cache.
fn vanished(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "Workload vanished during the pass");
            Ok(())
        }
        other => other,
    }
}

/// Restore a saved replica count once it is older than the grace period.
///
/// Returns the action to take instead of the rest of the pass, or `None`
/// when no restore is owed.
async fn restore_if_due(
    key: &WorkloadRef,
    workload: &Workload,
    ctx: &Context,
) -> Result<Option<Action>> {
    if !key.kind.is_scalable() {
        return Ok(None);
    }
    match saved_replicas(workload) {
        Ok(Some(_)) => {}
        Ok(None) => return Ok(None),
        Err(e) => {
            ctx.recorder
                .warning(&key.to_string(), REASON_INVALID_MARKER, &e.to_string());
            return Err(e);
        }
    }

    if let Some(at) = scaled_down_at(workload) {
        let age = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
        if age < ctx.restore_grace {
            let wait = ctx.restore_grace - age;
            debug!(wait = ?wait, "Scale run in progress, checking again later");
            return Ok(Some(Action::requeue(wait)));
        }
    }

    match scale::restore(ctx.gateway.as_ref(), key).await? {
        RestoreOutcome::Restored(replicas) => {
            ctx.recorder.normal(
                &key.to_string(),
                REASON_REPLICAS_RESTORED,
                &format!("restored {} replica(s) left by an interrupted scale run", replicas),
            );
            // The annotation change comes back through the watch and
            // triggers the next pass.
            Ok(Some(Action::await_change()))
        }
        RestoreOutcome::NothingToRestore | RestoreOutcome::NotScalable => Ok(None),
    }
}

async fn inject(
    key: &WorkloadRef,
    policy: &BackupPolicy,
    applied: AppliedPolicy,
    ctx: &Context,
) -> Result<()> {
    let kind = key.kind;
    let name = key.name.clone();
    let sidecar = &ctx.sidecar;
    let mutate = |w: &mut Workload| -> Result<()> {
        sidecar.inject(w.pod_template_mut(), policy, kind, &name);
        set_applied_policy(w, &applied)
    };
    let updated = ctx.gateway.patch_workload(key, &mutate).await?;

    metrics::INJECTIONS.with_label_values(&[kind.as_str()]).inc();
    ctx.recorder.normal(
        &key.to_string(),
        REASON_SIDECAR_INJECTED,
        &format!("backup component injected for BackupPolicy {}/{}", applied.namespace, applied.name),
    );
    info!(policy = %applied.name, "Injected backup component");

    restart_if_needed(key, &updated, ctx).await;
    Ok(())
}

async fn remove(key: &WorkloadRef, workload: &Workload, ctx: &Context) -> Result<()> {
    let mutate = |w: &mut Workload| -> Result<()> {
        if sidecar::has_sidecar(w.pod_template()) {
            sidecar::remove(w.pod_template_mut());
        }
        clear_applied_policy(w);
        Ok(())
    };
    let updated = ctx.gateway.patch_workload(key, &mutate).await?;
    rbac::retract_grant(ctx.gateway.as_ref(), key.kind, workload.name(), &key.namespace).await?;

    metrics::REMOVALS.with_label_values(&[key.kind.as_str()]).inc();
    ctx.recorder.normal(
        &key.to_string(),
        REASON_SIDECAR_REMOVED,
        "backup component removed",
    );
    info!("Removed backup component");

    restart_if_needed(key, &updated, ctx).await;
    Ok(())
}

/// Replica sets and replication controllers keep running pods on the old
/// template, so their pods are deleted to pick up the change
async fn restart_if_needed(key: &WorkloadRef, workload: &Workload, ctx: &Context) {
    if key.kind.rolls_out_template_changes() {
        return;
    }

    let selector = match workload.pod_selector() {
        Ok(selector) => selector,
        Err(e) => {
            warn!(error = %e, "Cannot select pods for restart");
            return;
        }
    };
    let pods = match ctx.gateway.list_pods(&key.namespace, &selector).await {
        Ok(pods) => pods,
        Err(e) => {
            ctx.recorder
                .warning(&key.to_string(), REASON_POD_RESTART_FAILED, &e.to_string());
            return;
        }
    };

    for pod in pods {
        let name = pod.name_any();
        if let Err(e) = ctx.gateway.delete_pod(&key.namespace, &name).await {
            ctx.recorder.warning(
                &key.to_string(),
                REASON_POD_RESTART_FAILED,
                &format!("failed to delete pod {}: {}", name, e),
            );
        }
    }
}

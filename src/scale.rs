//! Quiescence scale orchestration
//!
//! A scale run takes every scalable workload matching a selector to zero
//! replicas, waits for their pods to go away, and brings them back. The
//! replica count from before the run is written onto each workload before it
//! is touched, so an interrupted run can be resumed or restored without
//! in-memory state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::metrics;
use crate::workload::{
    is_daemon_or_stateful_set_pod, save_replicas, saved_replicas, take_saved_replicas, Workload,
    WorkloadKind, WorkloadRef, PREVIOUS_REPLICA_COUNT,
};

/// Drain polling bounds
#[derive(Clone, Copy, Debug)]
pub struct ScaleTiming {
    pub drain_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for ScaleTiming {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(300),
        }
    }
}

/// Phases of a scale run, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalePhase {
    ScalingDown,
    Draining,
    ScalingUp,
    Done,
}

impl fmt::Display for ScalePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalePhase::ScalingDown => "ScalingDown",
            ScalePhase::Draining => "Draining",
            ScalePhase::ScalingUp => "ScalingUp",
            ScalePhase::Done => "Done",
        };
        f.write_str(s)
    }
}

/// Summary of a completed scale run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScaleReport {
    /// Workloads taken to zero replicas
    pub scaled_down: Vec<WorkloadRef>,
    /// Whether every scalable pod was gone before the drain timeout
    pub drained: bool,
    /// Workloads brought back and the replica count they were given
    pub scaled_up: Vec<(WorkloadRef, i32)>,
    /// Daemon set and stateful set pods deleted so they restart
    pub restarted_pods: usize,
}

/// Result of restoring a single workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored(i32),
    NothingToRestore,
    NotScalable,
}

/// Drives scale runs through the cluster gateway
pub struct ScaleOrchestrator {
    gateway: Arc<dyn ClusterGateway>,
    timing: ScaleTiming,
}

impl ScaleOrchestrator {
    pub fn new(gateway: Arc<dyn ClusterGateway>, timing: ScaleTiming) -> Self {
        Self { gateway, timing }
    }

    /// Run scale-down, drain and scale-up for workloads in `namespace`
    /// matching `selector`.
    ///
    /// Any error while scaling down aborts the run; the saved annotations
    /// make the next run pick up where this one stopped. A drain timeout is
    /// logged and the run carries on to scale-up.
    #[instrument(skip(self), fields(namespace = %namespace, selector = %selector))]
    pub async fn run(&self, namespace: &str, selector: &str) -> Result<ScaleReport> {
        let mut report = ScaleReport::default();
        let mut phase = ScalePhase::ScalingDown;

        loop {
            debug!(phase = %phase, "Scale phase");
            phase = match phase {
                ScalePhase::ScalingDown => {
                    report.scaled_down = self.scale_down(namespace, selector).await.map_err(|e| {
                        metrics::SCALE_RUNS.with_label_values(&["failed"]).inc();
                        e
                    })?;
                    ScalePhase::Draining
                }
                ScalePhase::Draining => {
                    report.drained = self.drain(namespace, selector).await;
                    ScalePhase::ScalingUp
                }
                ScalePhase::ScalingUp => {
                    let (scaled_up, restarted) =
                        self.scale_up(namespace, selector).await.map_err(|e| {
                            metrics::SCALE_RUNS.with_label_values(&["failed"]).inc();
                            e
                        })?;
                    report.scaled_up = scaled_up;
                    report.restarted_pods = restarted;
                    ScalePhase::Done
                }
                ScalePhase::Done => break,
            };
        }

        metrics::SCALE_RUNS.with_label_values(&["succeeded"]).inc();
        info!(
            scaled_down = report.scaled_down.len(),
            scaled_up = report.scaled_up.len(),
            drained = report.drained,
            "Scale run complete"
        );
        Ok(report)
    }

    async fn scalable_workloads(&self, namespace: &str, selector: &str) -> Result<Vec<Workload>> {
        let mut found = Vec::new();
        for kind in WorkloadKind::SCALABLE {
            let listed = self
                .gateway
                .list_workloads(kind, Some(namespace), selector)
                .await?;
            found.extend(listed.into_iter().filter(|w| !w.is_owned_by_deployment()));
        }
        Ok(found)
    }

    async fn scale_down(&self, namespace: &str, selector: &str) -> Result<Vec<WorkloadRef>> {
        let now = Utc::now();
        let save_and_zero = move |w: &mut Workload| -> Result<()> {
            save_replicas(w, now)?;
            w.set_replicas(0);
            Ok(())
        };

        let mut scaled = Vec::new();
        for workload in self.scalable_workloads(namespace, selector).await? {
            let target = workload.reference();
            let updated = self.gateway.patch_workload(&target, &save_and_zero).await?;
            info!(
                workload = %target,
                saved = ?saved_replicas(&updated)?,
                "Scaled down"
            );
            scaled.push(target);
        }
        Ok(scaled)
    }

    /// Returns `true` once only daemon set and stateful set pods remain,
    /// `false` if the timeout expired first
    async fn drain(&self, namespace: &str, selector: &str) -> bool {
        let deadline = Instant::now() + self.timing.drain_timeout;
        loop {
            match self.gateway.list_pods(namespace, selector).await {
                Ok(pods) => {
                    let remaining = pods
                        .iter()
                        .filter(|p| !is_daemon_or_stateful_set_pod(p))
                        .count();
                    if remaining == 0 {
                        return true;
                    }
                    debug!(remaining, "Waiting for pods to terminate");
                }
                Err(e) => debug!(error = %e, "Pod listing failed while draining"),
            }

            if Instant::now() + self.timing.drain_interval > deadline {
                // Proceeding leaves a window where pods may still be writing.
                warn!(
                    timeout = ?self.timing.drain_timeout,
                    "Pods still running after drain timeout, scaling up anyway"
                );
                metrics::DRAIN_TIMEOUTS.inc();
                return false;
            }
            tokio::time::sleep(self.timing.drain_interval).await;
        }
    }

    async fn scale_up(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(Vec<(WorkloadRef, i32)>, usize)> {
        let mut scaled_up = Vec::new();
        let mut first_error = None;

        for workload in self.scalable_workloads(namespace, selector).await? {
            let target = workload.reference();
            let owes_restore = workload.annotation(PREVIOUS_REPLICA_COUNT).is_some();
            if !owes_restore && workload.replicas() != Some(0) {
                continue;
            }

            match self.gateway.patch_workload(&target, &restore_or_wake).await {
                Ok(updated) => {
                    let replicas = updated.replicas().unwrap_or_default();
                    info!(workload = %target, replicas, "Scaled up");
                    scaled_up.push((target, replicas));
                }
                Err(e) => {
                    error!(workload = %target, error = %e, "Failed to scale up");
                    first_error.get_or_insert(e);
                }
            }
        }

        let mut restarted = 0;
        match self.gateway.list_pods(namespace, selector).await {
            Ok(pods) => {
                for pod in pods.iter().filter(|p| is_daemon_or_stateful_set_pod(p)) {
                    let name = pod.metadata.name.as_deref().unwrap_or_default();
                    match self.gateway.delete_pod(namespace, name).await {
                        Ok(_) => restarted += 1,
                        Err(e) => error!(pod = %name, error = %e, "Failed to delete pod"),
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to list pods for restart"),
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok((scaled_up, restarted)),
        }
    }
}

/// Put back the saved replica count. A workload left at zero with nothing
/// saved gets a single replica.
fn restore_or_wake(w: &mut Workload) -> Result<()> {
    match take_saved_replicas(w)? {
        Some(replicas) => {
            w.set_replicas(replicas);
        }
        None if w.replicas() == Some(0) => {
            w.set_replicas(1);
        }
        None => {}
    }
    Ok(())
}

/// Restore one workload from its saved replica count and clear the saved
/// state. Stateful sets and daemon sets are never scaled, so there is
/// nothing to restore.
#[instrument(skip(gateway), fields(workload = %target))]
pub async fn restore(gateway: &dyn ClusterGateway, target: &WorkloadRef) -> Result<RestoreOutcome> {
    if !target.kind.is_scalable() {
        return Ok(RestoreOutcome::NotScalable);
    }

    let current = gateway
        .get_workload(target)
        .await?
        .ok_or_else(|| Error::NotFound(target.to_string()))?;
    if saved_replicas(&current)?.is_none() {
        return Ok(RestoreOutcome::NothingToRestore);
    }

    let take_and_apply = |w: &mut Workload| -> Result<()> {
        if let Some(replicas) = take_saved_replicas(w)? {
            w.set_replicas(replicas);
        }
        Ok(())
    };
    let updated = gateway.patch_workload(target, &take_and_apply).await?;
    let replicas = updated.replicas().unwrap_or_default();

    metrics::RESTORES.with_label_values(&[target.kind.as_str()]).inc();
    info!(replicas, "Restored replicas");
    Ok(RestoreOutcome::Restored(replicas))
}

/// [`restore`] for a workload named by a kind string, as passed on the
/// command line. An unrecognised kind is an error.
pub async fn restore_named(
    gateway: &dyn ClusterGateway,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<RestoreOutcome> {
    let kind: WorkloadKind = kind.parse()?;
    restore(gateway, &WorkloadRef::new(kind, namespace, name)).await
}

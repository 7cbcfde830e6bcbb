//! Controllers for BackupPolicy resources and the workloads they select
//!
//! Each controller owns the informers that keep its watch cache current and
//! a pool of workers draining its work queue into the reconcilers.

mod policy_controller;
mod workload_controller;

use std::sync::Arc;
use std::time::Duration;

use kube::{api::ListParams, Api, Client};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::Cache;
use crate::config::OperatorConfig;
use crate::crd::BackupPolicy;
use crate::error::{Error, Result};
use crate::events::EventRecorder;
use crate::gateway::ClusterGateway;
use crate::metrics;
use crate::queue::{ObjectKey, WorkQueue};
use crate::scale::ScaleTiming;
use crate::sidecar::SidecarConfig;
use crate::workload::{Workload, WorkloadRef};

/// Shared context for all controllers
pub struct Context {
    /// Access to cluster state
    pub gateway: Arc<dyn ClusterGateway>,
    /// Watch cache of backup policies, cluster-wide
    pub policies: Cache<BackupPolicy>,
    /// Watch cache of all five workload kinds, cluster-wide
    pub workloads: Cache<Workload>,
    pub policy_queue: WorkQueue<ObjectKey>,
    pub workload_queue: WorkQueue<WorkloadRef>,
    pub recorder: EventRecorder,
    pub sidecar: SidecarConfig,
    /// Image run by scheduled scale-down jobs
    pub operator_image: String,
    /// Drain bounds passed on to scheduled scale-down jobs
    pub scale_timing: ScaleTiming,
    /// Age a saved replica count must reach before the reconciler restores it
    pub restore_grace: Duration,
}

impl Context {
    /// Create a new context
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: &OperatorConfig) -> Self {
        let retry = config.retry_policy();
        Self {
            gateway,
            policies: Cache::new(),
            workloads: Cache::new(),
            policy_queue: WorkQueue::new("policy", retry),
            workload_queue: WorkQueue::new("workload", retry),
            recorder: EventRecorder::new(),
            sidecar: SidecarConfig::new(config.sidecar_image.clone()),
            operator_image: config.operator_image.clone(),
            scale_timing: config.scale_timing(),
            restore_grace: config.restore_grace(),
        }
    }
}

/// Run both controllers until `shutdown` fires.
///
/// Workers start only after every watch cache has completed its first
/// listing, so reconcilers never act on a partial view of the cluster.
pub async fn run(
    client: Client,
    ctx: Arc<Context>,
    workers: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let api: Api<BackupPolicy> = Api::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("BackupPolicy CRD not installed: {}", e);
        return Err(e.into());
    }

    let mut synced: Vec<watch::Receiver<bool>> = Vec::new();
    synced.push(policy_controller::start_informer(
        client.clone(),
        &ctx,
        shutdown.clone(),
    ));
    synced.extend(workload_controller::start_informers(
        client,
        &ctx,
        shutdown.clone(),
    ));

    for rx in synced.iter_mut() {
        let stopped = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = rx.wait_for(|done| *done) => result.is_err(),
        };
        if stopped {
            return Err(Error::config("watch stream ended before the initial listing"));
        }
    }
    metrics::OPERATOR_READY.set(1.0);
    info!("Watch caches synced, starting workers");

    let policy_workers = tokio::spawn(policy_controller::run_workers(ctx.clone(), workers));
    let workload_workers = tokio::spawn(workload_controller::run_workers(ctx.clone(), workers));

    shutdown.cancelled().await;
    info!("Stopping controllers");
    metrics::OPERATOR_READY.set(0.0);
    ctx.policy_queue.shutdown().await;
    ctx.workload_queue.shutdown().await;

    for handle in [policy_workers, workload_workers] {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker pool failed");
        }
    }
    Ok(())
}

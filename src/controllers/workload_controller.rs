//! Workload controller
//!
//! One informer per workload kind feeds a shared cache and a single queue.

use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::ReplicationController;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cache::{workload_event_key, Informer};
use crate::controllers::Context;
use crate::error::Result;
use crate::metrics;
use crate::queue::{self, Action};
use crate::reconcilers::workload as workload_reconciler;
use crate::workload::{Workload, WorkloadKind, WorkloadRef};

fn start<K>(
    client: Client,
    ctx: &Context,
    label: &'static str,
    scope: fn(&Workload) -> bool,
    shutdown: CancellationToken,
) -> watch::Receiver<bool>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    Workload: From<K>,
{
    let (tx, rx) = watch::channel(false);
    let informer = Informer::new(
        Api::<K>::all(client),
        label,
        ctx.workloads.clone(),
        scope,
        workload_event_key,
        ctx.workload_queue.clone(),
    );
    tokio::spawn(informer.run(tx, shutdown));
    rx
}

/// Start one informer per workload kind, returning their sync signals
pub fn start_informers(
    client: Client,
    ctx: &Context,
    shutdown: CancellationToken,
) -> Vec<watch::Receiver<bool>> {
    vec![
        start::<Deployment>(
            client.clone(),
            ctx,
            "Deployment",
            |w| w.kind() == WorkloadKind::Deployment,
            shutdown.clone(),
        ),
        start::<ReplicaSet>(
            client.clone(),
            ctx,
            "ReplicaSet",
            |w| w.kind() == WorkloadKind::ReplicaSet,
            shutdown.clone(),
        ),
        start::<ReplicationController>(
            client.clone(),
            ctx,
            "ReplicationController",
            |w| w.kind() == WorkloadKind::ReplicationController,
            shutdown.clone(),
        ),
        start::<StatefulSet>(
            client.clone(),
            ctx,
            "StatefulSet",
            |w| w.kind() == WorkloadKind::StatefulSet,
            shutdown.clone(),
        ),
        start::<DaemonSet>(
            client,
            ctx,
            "DaemonSet",
            |w| w.kind() == WorkloadKind::DaemonSet,
            shutdown,
        ),
    ]
}

/// Drain the workload queue until it is shut down
pub async fn run_workers(ctx: Arc<Context>, workers: usize) {
    info!(workers, "Starting workload controller");
    let queue = ctx.workload_queue.clone();
    queue::run_workers(queue, workers, move |key| reconcile(key, ctx.clone())).await;
    info!("Workload controller stopped");
}

#[instrument(skip(ctx), fields(workload = %key))]
async fn reconcile(key: WorkloadRef, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["workload"])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&["workload"]).inc();

    workload_reconciler::reconcile(&key, &ctx).await
}

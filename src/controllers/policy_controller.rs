//! BackupPolicy controller
//!
//! Watches BackupPolicy resources and triggers reconciliation.

use std::sync::Arc;

use kube::{Api, Client};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cache::{policy_event_key, Informer};
use crate::controllers::Context;
use crate::crd::BackupPolicy;
use crate::error::Result;
use crate::metrics;
use crate::queue::{self, Action, ObjectKey};
use crate::reconcilers::policy as policy_reconciler;

/// Start the BackupPolicy informer, returning its sync signal
pub fn start_informer(
    client: Client,
    ctx: &Context,
    shutdown: CancellationToken,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let api: Api<BackupPolicy> = Api::all(client);
    let informer = Informer::new(
        api,
        "BackupPolicy",
        ctx.policies.clone(),
        |_| true,
        policy_event_key,
        ctx.policy_queue.clone(),
    );
    tokio::spawn(informer.run(tx, shutdown));
    rx
}

/// Drain the policy queue until it is shut down
pub async fn run_workers(ctx: Arc<Context>, workers: usize) {
    info!(workers, "Starting BackupPolicy controller");
    let queue = ctx.policy_queue.clone();
    queue::run_workers(queue, workers, move |key| reconcile(key, ctx.clone())).await;
    info!("BackupPolicy controller stopped");
}

#[instrument(skip(ctx), fields(namespace = %key.namespace, name = %key.name))]
async fn reconcile(key: ObjectKey, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["policy"])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&["policy"]).inc();

    policy_reconciler::reconcile(&key, &ctx).await
}

//! `scaledown` and `scaleup` commands

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::scale::{self as orchestrator, RestoreOutcome, ScaleOrchestrator, ScaleReport, ScaleTiming};
use crate::selector;

/// Run a full scale cycle over the workloads matching `selector`.
///
/// An empty selector is refused, since it would take down every workload
/// in the namespace.
pub async fn scale_down(
    gateway: Arc<dyn ClusterGateway>,
    namespace: &str,
    selector: &str,
    timing: ScaleTiming,
) -> Result<ScaleReport> {
    let compiled = selector::parse(selector)?;
    if compiled.selects_all() {
        return Err(Error::validation("scaledown requires a non-empty --selector"));
    }

    info!(namespace = %namespace, selector = %compiled, "Starting scale-down");
    ScaleOrchestrator::new(gateway, timing)
        .run(namespace, &compiled.to_string())
        .await
}

/// Restore one workload's saved replica count
pub async fn scale_up(
    gateway: &dyn ClusterGateway,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<RestoreOutcome> {
    let outcome = orchestrator::restore_named(gateway, kind, namespace, name).await?;
    info!(kind = %kind, namespace = %namespace, name = %name, outcome = ?outcome, "Scale-up finished");
    Ok(outcome)
}

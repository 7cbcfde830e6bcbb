//! OSO Workload Backup Kubernetes Operator
//!
//! Main entry point. `run` starts the operator; `scaledown`, `scaleup` and
//! `check` are one-shot commands used by scheduled jobs and the injected
//! backup component.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use workload_backup_operator::{
    commands::{self, check::CheckOptions},
    config::{ClusterArgs, OperatorConfig},
    controllers::{self, Context},
    gateway::{ClusterGateway, KubeGateway},
    metrics, rbac,
    scale::ScaleTiming,
};

#[derive(Parser)]
#[command(
    name = "workload-backup-operator",
    about = "Injects backup components into labelled workloads",
    version
)]
struct Cli {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the operator
    Run(OperatorConfig),

    /// Scale down workloads matching a selector, wait for their pods to
    /// terminate, and scale them back up
    Scaledown {
        /// Label selector of the workloads to cycle
        #[arg(long)]
        selector: String,

        #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
        namespace: String,

        /// Seconds between drain checks
        #[arg(long, default_value_t = 2)]
        drain_interval_secs: u64,

        /// Seconds to wait for pods to terminate
        #[arg(long, default_value_t = 300)]
        drain_timeout_secs: u64,
    },

    /// Restore the replica count saved before a scale-down
    Scaleup {
        /// Workload kind (deployment, replicaset, replicationcontroller, ...)
        #[arg(long)]
        kind: String,

        #[arg(long)]
        name: String,

        #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
        namespace: String,
    },

    /// Validate a BackupPolicy and report the workloads it selects
    Check {
        #[arg(long)]
        policy_name: String,

        #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
        namespace: String,

        /// Host name for the workload
        #[arg(long)]
        host_name: Option<String>,

        /// Prefix for the backup repository path
        #[arg(long)]
        smart_prefix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Command::Run(_)));

    match cli.command {
        Command::Run(config) => run_operator(&cli.cluster, config).await,
        Command::Scaledown {
            selector,
            namespace,
            drain_interval_secs,
            drain_timeout_secs,
        } => {
            let gateway = connect(&cli.cluster).await?;
            let timing = ScaleTiming {
                drain_interval: Duration::from_secs(drain_interval_secs),
                drain_timeout: Duration::from_secs(drain_timeout_secs),
            };
            let report =
                commands::scale::scale_down(gateway, &namespace, &selector, timing).await?;
            info!(
                scaled_down = report.scaled_down.len(),
                scaled_up = report.scaled_up.len(),
                drained = report.drained,
                "Exiting scaledown"
            );
            Ok(())
        }
        Command::Scaleup {
            kind,
            name,
            namespace,
        } => {
            let gateway = connect(&cli.cluster).await?;
            commands::scale::scale_up(gateway.as_ref(), &kind, &namespace, &name).await?;
            info!("Exiting scaleup");
            Ok(())
        }
        Command::Check {
            policy_name,
            namespace,
            host_name,
            smart_prefix,
        } => {
            let gateway = connect(&cli.cluster).await?;
            let options = CheckOptions {
                policy_name,
                namespace,
                host_name,
                smart_prefix,
            };
            commands::check::run(gateway.as_ref(), &options).await?;
            info!("Exiting check");
            Ok(())
        }
    }
}

async fn connect(cluster: &ClusterArgs) -> anyhow::Result<Arc<dyn ClusterGateway>> {
    let client = cluster.client().await?;
    Ok(Arc::new(KubeGateway::new(client)))
}

async fn run_operator(cluster: &ClusterArgs, config: OperatorConfig) -> anyhow::Result<()> {
    info!("Starting OSO Workload Backup Operator");
    config.validate()?;

    // Create Kubernetes client
    let client = cluster.client().await?;
    info!("Connected to Kubernetes API server");

    let gateway: Arc<dyn ClusterGateway> = Arc::new(KubeGateway::new(client.clone()));
    rbac::ensure_sidecar_cluster_role(gateway.as_ref()).await?;

    // Create shared context
    let context = Arc::new(Context::new(gateway, &config));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    let shutdown = CancellationToken::new();
    let mut controllers = tokio::spawn(controllers::run(
        client,
        context,
        config.workers,
        shutdown.clone(),
    ));

    // Handle graceful shutdown
    tokio::select! {
        result = &mut controllers => {
            match result {
                Ok(Ok(())) => error!("Controllers exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Controllers failed"),
                Err(e) => error!(error = %e, "Controller task failed"),
            }
            metrics::OPERATOR_HEALTH.set(0.0);
            anyhow::bail!("controllers stopped");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    shutdown.cancel();
    if let Ok(Err(e)) = controllers.await {
        error!(error = %e, "Controllers failed during shutdown");
    }

    info!("OSO Workload Backup Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber. The operator logs JSON; one-shot commands
/// log plain lines.
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

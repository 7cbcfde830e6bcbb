//! Operator configuration
//!
//! Flags double as environment variables so the operator can be configured
//! from a Deployment manifest without rewriting its arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};
use crate::queue::RetryPolicy;
use crate::scale::ScaleTiming;

/// How to reach the cluster
#[derive(Args, Clone, Debug, Default)]
pub struct ClusterArgs {
    /// Address of the API server, overriding the one in the kubeconfig
    #[arg(long, global = true, env = "KUBE_MASTER")]
    pub master: Option<String>,

    /// Path to a kubeconfig file. Defaults to in-cluster configuration or
    /// the standard kubeconfig locations.
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,
}

impl ClusterArgs {
    /// Resolve client configuration without connecting
    pub async fn load_config(&self) -> Result<kube::Config> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                debug!(path = %path.display(), "Loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path)?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::config(format!("cannot infer cluster configuration: {}", e)))?,
        };

        if let Some(master) = &self.master {
            config.cluster_url = master
                .parse()
                .map_err(|e| Error::config(format!("invalid --master '{}': {}", master, e)))?;
        }

        Ok(config)
    }

    pub async fn client(&self) -> Result<Client> {
        let config = self.load_config().await?;
        Ok(Client::try_from(config)?)
    }
}

/// Settings of the long-running operator
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Concurrent reconcile workers per queue
    #[arg(long, env = "BACKUP_OPERATOR_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Retries of a failing key before it is dropped
    #[arg(long, env = "BACKUP_OPERATOR_MAX_REQUEUES", default_value_t = 5)]
    pub max_requeues: u32,

    /// First retry delay in milliseconds; doubles on each retry
    #[arg(long, env = "BACKUP_OPERATOR_RETRY_BASE_MS", default_value_t = 500)]
    pub retry_base_ms: u64,

    /// Upper bound on the retry delay in seconds
    #[arg(long, env = "BACKUP_OPERATOR_RETRY_MAX_SECS", default_value_t = 300)]
    pub retry_max_secs: u64,

    /// Image of the injected backup component
    #[arg(
        long,
        env = "BACKUP_SIDECAR_IMAGE",
        default_value = "ghcr.io/osodevops/workload-backup-sidecar:latest"
    )]
    pub sidecar_image: String,

    /// Image run by scheduled scale-down jobs
    #[arg(
        long,
        env = "BACKUP_OPERATOR_IMAGE",
        default_value = "ghcr.io/osodevops/workload-backup-operator:latest"
    )]
    pub operator_image: String,

    /// Port of the metrics and health endpoints
    #[arg(long, env = "BACKUP_OPERATOR_METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Seconds between drain checks
    #[arg(long, env = "BACKUP_DRAIN_INTERVAL_SECS", default_value_t = 2)]
    pub drain_interval_secs: u64,

    /// Seconds to wait for pods to terminate before scaling back up
    #[arg(long, env = "BACKUP_DRAIN_TIMEOUT_SECS", default_value_t = 300)]
    pub drain_timeout_secs: u64,

    /// Seconds a saved replica count is left alone before the reconciler
    /// restores it
    #[arg(long, env = "BACKUP_RESTORE_GRACE_SECS", default_value_t = 600)]
    pub restore_grace_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_requeues: 5,
            retry_base_ms: 500,
            retry_max_secs: 300,
            sidecar_image: "ghcr.io/osodevops/workload-backup-sidecar:latest".to_string(),
            operator_image: "ghcr.io/osodevops/workload-backup-operator:latest".to_string(),
            metrics_port: 8080,
            drain_interval_secs: 2,
            drain_timeout_secs: 300,
            restore_grace_secs: 600,
        }
    }
}

impl OperatorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            max: Duration::from_secs(self.retry_max_secs),
            max_retries: self.max_requeues,
        }
    }

    pub fn scale_timing(&self) -> ScaleTiming {
        ScaleTiming {
            drain_interval: Duration::from_secs(self.drain_interval_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    pub fn restore_grace(&self) -> Duration {
        Duration::from_secs(self.restore_grace_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.retry_base_ms == 0 {
            return Err(Error::config("retry base delay must be positive"));
        }
        if self.drain_interval_secs == 0 {
            return Err(Error::config("drain interval must be positive"));
        }
        if self.sidecar_image.trim().is_empty() {
            return Err(Error::config("sidecar image is required"));
        }
        // A restore before the drain deadline would scale workloads back up
        // while their pods are still terminating.
        if self.restore_grace_secs <= self.drain_timeout_secs {
            return Err(Error::config(format!(
                "restore grace ({}s) must exceed the drain timeout ({}s)",
                self.restore_grace_secs, self.drain_timeout_secs
            )));
        }
        Ok(())
    }
}

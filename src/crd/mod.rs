//! Custom Resource Definitions for the Workload Backup Operator

mod backup_policy;

pub use backup_policy::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&BackupPolicy::crd())?])
}

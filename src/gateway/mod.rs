//! Cluster gateway
//!
//! Every read and write the operator makes against cluster state goes
//! through [`ClusterGateway`]. Components receive it as a trait object so
//! the reconciliation logic can be exercised against an in-memory cluster.

mod kubernetes;

pub use kubernetes::KubeGateway;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};

use crate::crd::{BackupPolicy, BackupPolicyStatus};
use crate::error::Result;
use crate::workload::{Workload, WorkloadKind, WorkloadRef};

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "workload-backup-operator";

/// Mutation applied to a freshly read workload by [`ClusterGateway::patch_workload`]
pub type WorkloadMutation<'a> = &'a (dyn Fn(&mut Workload) -> Result<()> + Send + Sync);

/// Typed access to cluster resources
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// List workloads of one kind. `namespace: None` lists cluster-wide;
    /// an empty selector matches everything.
    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<Workload>>;

    /// Fetch a workload, `Ok(None)` if it does not exist
    async fn get_workload(&self, target: &WorkloadRef) -> Result<Option<Workload>>;

    /// Apply `mutate` to a fresh copy of the workload and submit it.
    ///
    /// Conflicting concurrent writes are retried with a fresh read, so the
    /// mutation must be expressed relative to whatever the current object
    /// is. No write is issued when the mutation leaves the object unchanged.
    async fn patch_workload(
        &self,
        target: &WorkloadRef,
        mutate: WorkloadMutation<'_>,
    ) -> Result<Workload>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Delete a pod; `Ok(false)` if it was already gone
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<BackupPolicy>>;

    async fn list_policies(&self, namespace: Option<&str>) -> Result<Vec<BackupPolicy>>;

    async fn patch_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupPolicyStatus,
    ) -> Result<()>;

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()>;

    /// Delete a role binding; `Ok(false)` if it was already gone
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn apply_role(&self, role: &Role) -> Result<()>;

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()>;

    async fn apply_service_account(&self, account: &ServiceAccount) -> Result<()>;

    /// Create or update a cron job, returning the stored object
    async fn apply_cron_job(&self, job: &CronJob) -> Result<CronJob>;

    /// Delete a cron job; `Ok(false)` if it was already gone
    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<bool>;
}

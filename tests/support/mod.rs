//! Shared fixtures: an in-memory cluster behind the `ClusterGateway` trait
//! and builders for the objects the tests need.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, ReplicaSet, ReplicaSetSpec, StatefulSet,
    StatefulSetSpec,
};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, PodTemplateSpec, ReplicationController, ReplicationControllerSpec,
    ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::core::ErrorResponse;
use workload_backup_operator::config::OperatorConfig;
use workload_backup_operator::controllers::Context;
use workload_backup_operator::crd::{BackupPolicy, BackupPolicySpec, BackupPolicyStatus, BackupType};
use workload_backup_operator::error::{Error, Result};
use workload_backup_operator::gateway::{ClusterGateway, WorkloadMutation};
use workload_backup_operator::queue::WorkQueue;
use workload_backup_operator::selector;
use workload_backup_operator::workload::{Workload, WorkloadKind, WorkloadRef};

type NamespacedName = (String, String);

fn nn(namespace: &str, name: &str) -> NamespacedName {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    workloads: BTreeMap<WorkloadRef, Workload>,
    pods: BTreeMap<NamespacedName, Pod>,
    policies: BTreeMap<NamespacedName, BackupPolicy>,
    statuses: BTreeMap<NamespacedName, BackupPolicyStatus>,
    role_bindings: BTreeMap<NamespacedName, RoleBinding>,
    roles: BTreeMap<NamespacedName, Role>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    service_accounts: BTreeMap<NamespacedName, ServiceAccount>,
    cron_jobs: BTreeMap<NamespacedName, CronJob>,
    deleted_pods: Vec<String>,
    workload_writes: usize,
    failing_patches: Vec<WorkloadRef>,
    sticky_pods: bool,
}

/// In-memory cluster. Scaling a workload to zero removes its pods unless
/// pods are made sticky.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector::parse(selector)
        .map(|s| selector::matches(&s, labels))
        .unwrap_or(false)
}

fn owned_by(pod: &Pod, kind: WorkloadKind, name: &str) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|r| r.kind == kind.as_str() && r.name == name)
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workload(&self, workload: Workload) {
        let key = workload.reference();
        self.state.lock().unwrap().workloads.insert(key, workload);
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = nn(
            pod.metadata.namespace.as_deref().unwrap_or("default"),
            pod.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().pods.insert(key, pod);
    }

    pub fn add_policy(&self, policy: BackupPolicy) {
        let key = nn(
            policy.metadata.namespace.as_deref().unwrap_or("default"),
            policy.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().policies.insert(key, policy);
    }

    pub fn remove_policy(&self, namespace: &str, name: &str) {
        self.state.lock().unwrap().policies.remove(&nn(namespace, name));
    }

    pub fn workload(&self, target: &WorkloadRef) -> Workload {
        self.state.lock().unwrap().workloads[target].clone()
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.state.lock().unwrap().workloads.values().cloned().collect()
    }

    pub fn policies(&self) -> Vec<BackupPolicy> {
        self.state.lock().unwrap().policies.values().cloned().collect()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pods
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_pods.clone()
    }

    pub fn status(&self, namespace: &str, name: &str) -> Option<BackupPolicyStatus> {
        self.state.lock().unwrap().statuses.get(&nn(namespace, name)).cloned()
    }

    pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.state.lock().unwrap().role_bindings.get(&nn(namespace, name)).cloned()
    }

    pub fn role(&self, namespace: &str, name: &str) -> Option<Role> {
        self.state.lock().unwrap().roles.get(&nn(namespace, name)).cloned()
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .get(&nn(namespace, name))
            .cloned()
    }

    pub fn cluster_role(&self, name: &str) -> Option<ClusterRole> {
        self.state.lock().unwrap().cluster_roles.get(name).cloned()
    }

    pub fn cron_job(&self, namespace: &str, name: &str) -> Option<CronJob> {
        self.state.lock().unwrap().cron_jobs.get(&nn(namespace, name)).cloned()
    }

    /// Number of workload writes that changed an object
    pub fn workload_writes(&self) -> usize {
        self.state.lock().unwrap().workload_writes
    }

    /// Make every patch of `target` fail with a server error
    pub fn fail_patches_of(&self, target: WorkloadRef) {
        self.state.lock().unwrap().failing_patches.push(target);
    }

    /// Keep pods around after their workload is scaled to zero
    pub fn make_pods_sticky(&self) {
        self.state.lock().unwrap().sticky_pods = true;
    }
}

#[async_trait]
impl ClusterGateway for FakeCluster {
    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<Workload>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workloads
            .values()
            .filter(|w| w.kind() == kind)
            .filter(|w| namespace.map_or(true, |ns| w.namespace() == ns))
            .filter(|w| selector.is_empty() || selector_matches(selector, w.labels()))
            .cloned()
            .collect())
    }

    async fn get_workload(&self, target: &WorkloadRef) -> Result<Option<Workload>> {
        Ok(self.state.lock().unwrap().workloads.get(target).cloned())
    }

    async fn patch_workload(
        &self,
        target: &WorkloadRef,
        mutate: WorkloadMutation<'_>,
    ) -> Result<Workload> {
        let mut state = self.state.lock().unwrap();
        if state.failing_patches.contains(target) {
            return Err(api_error(500, "InternalError", format!("patch of {} failed", target)));
        }
        let current = state
            .workloads
            .get(target)
            .cloned()
            .ok_or_else(|| Error::NotFound(target.to_string()))?;
        let mut desired = current.clone();
        mutate(&mut desired)?;
        if desired == current {
            return Ok(current);
        }

        state.workload_writes += 1;
        if desired.replicas() == Some(0) && !state.sticky_pods {
            state
                .pods
                .retain(|_, pod| !owned_by(pod, target.kind, &target.name));
        }
        state.workloads.insert(target.clone(), desired.clone());
        Ok(desired)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, pod)| selector_matches(selector, pod.metadata.labels.as_ref()))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let removed = state.pods.remove(&nn(namespace, name)).is_some();
        if removed {
            state.deleted_pods.push(name.to_string());
        }
        Ok(removed)
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<BackupPolicy>> {
        Ok(self.state.lock().unwrap().policies.get(&nn(namespace, name)).cloned())
    }

    async fn list_policies(&self, namespace: Option<&str>) -> Result<Vec<BackupPolicy>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .policies
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |n| n == ns))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn patch_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupPolicyStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = nn(namespace, name);
        if !state.policies.contains_key(&key) {
            return Err(api_error(404, "NotFound", format!("policy {}/{} not found", namespace, name)));
        }
        if let Some(policy) = state.policies.get_mut(&key) {
            policy.status = Some(status.clone());
        }
        state.statuses.insert(key, status.clone());
        Ok(())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        let key = nn(
            binding.metadata.namespace.as_deref().unwrap_or_default(),
            binding.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().role_bindings.insert(key, binding.clone());
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .role_bindings
            .remove(&nn(namespace, name))
            .is_some())
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        let key = nn(
            role.metadata.namespace.as_deref().unwrap_or_default(),
            role.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().roles.insert(key, role.clone());
        Ok(())
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        let name = role.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().cluster_roles.insert(name, role.clone());
        Ok(())
    }

    async fn apply_service_account(&self, account: &ServiceAccount) -> Result<()> {
        let key = nn(
            account.metadata.namespace.as_deref().unwrap_or_default(),
            account.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .insert(key, account.clone());
        Ok(())
    }

    async fn apply_cron_job(&self, job: &CronJob) -> Result<CronJob> {
        let name = job.metadata.name.clone().unwrap_or_default();
        let key = nn(job.metadata.namespace.as_deref().unwrap_or_default(), &name);
        let mut stored = job.clone();
        stored.metadata.uid = Some(format!("uid-cronjob-{}", name));
        self.state.lock().unwrap().cron_jobs.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .cron_jobs
            .remove(&nn(namespace, name))
            .is_some())
    }
}

// ============================================================================
// Context Helpers
// ============================================================================

pub fn context(cluster: std::sync::Arc<FakeCluster>) -> Context {
    Context::new(cluster, &OperatorConfig::default())
}

/// Mirror the fake cluster into the context's watch caches, as the
/// informers would after a relist
pub fn sync_caches(ctx: &Context, cluster: &FakeCluster) {
    ctx.workloads
        .replace_scope(|_| true, cluster.workloads());
    ctx.policies.replace_scope(|_| true, cluster.policies());
}

/// Pop every pending key, marking each one done
pub async fn drain_queue<K>(queue: &WorkQueue<K>) -> Vec<K>
where
    K: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static,
{
    let mut keys = Vec::new();
    while queue.len().await > 0 {
        if let Some(key) = queue.pop().await {
            queue.done(&key).await;
            keys.push(key);
        }
    }
    keys
}

// ============================================================================
// Object Builders
// ============================================================================

pub const NAMESPACE: &str = "shop";

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn meta(name: &str, pairs: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(format!("uid-{}", name)),
        labels: Some(labels(pairs)),
        ..Default::default()
    }
}

fn template(pairs: &[(&str, &str)]) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels(pairs)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("nginx:1.27".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

fn label_selector(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels(pairs)),
        match_expressions: None,
    }
}

pub fn deployment(name: &str, pairs: &[(&str, &str)], replicas: i32) -> Workload {
    Workload::Deployment(Deployment {
        metadata: meta(name, pairs),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: label_selector(pairs),
            template: template(pairs),
            ..Default::default()
        }),
        status: None,
    })
}

pub fn replica_set(name: &str, pairs: &[(&str, &str)], replicas: i32) -> Workload {
    Workload::ReplicaSet(ReplicaSet {
        metadata: meta(name, pairs),
        spec: Some(ReplicaSetSpec {
            replicas: Some(replicas),
            selector: label_selector(pairs),
            template: Some(template(pairs)),
            ..Default::default()
        }),
        status: None,
    })
}

/// Replica set created by the named deployment
pub fn owned_replica_set(name: &str, deployment: &str, pairs: &[(&str, &str)], replicas: i32) -> Workload {
    let mut rs = replica_set(name, pairs, replicas);
    rs.metadata_mut().owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: deployment.to_string(),
        uid: format!("uid-{}", deployment),
        controller: Some(true),
        ..Default::default()
    }]);
    rs
}

pub fn replication_controller(name: &str, pairs: &[(&str, &str)], replicas: i32) -> Workload {
    Workload::ReplicationController(ReplicationController {
        metadata: meta(name, pairs),
        spec: Some(ReplicationControllerSpec {
            replicas: Some(replicas),
            selector: Some(labels(pairs)),
            template: Some(template(pairs)),
            ..Default::default()
        }),
        status: None,
    })
}

pub fn stateful_set(name: &str, pairs: &[(&str, &str)], replicas: i32) -> Workload {
    Workload::StatefulSet(StatefulSet {
        metadata: meta(name, pairs),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: label_selector(pairs),
            template: template(pairs),
            ..Default::default()
        }),
        status: None,
    })
}

pub fn daemon_set(name: &str, pairs: &[(&str, &str)]) -> Workload {
    Workload::DaemonSet(DaemonSet {
        metadata: meta(name, pairs),
        spec: Some(DaemonSetSpec {
            selector: label_selector(pairs),
            template: template(pairs),
            ..Default::default()
        }),
        status: None,
    })
}

/// Pod owned by a workload of `kind` named `owner`
pub fn pod(name: &str, pairs: &[(&str, &str)], kind: WorkloadKind, owner: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels(pairs)),
            owner_references: Some(vec![OwnerReference {
                api_version: kind.api_version().to_string(),
                kind: kind.as_str().to_string(),
                name: owner.to_string(),
                uid: format!("uid-{}", owner),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: None,
        status: None,
    }
}

pub fn policy(name: &str, pairs: &[(&str, &str)], backup_type: BackupType) -> BackupPolicy {
    let mut p = BackupPolicy::new(
        name,
        BackupPolicySpec {
            selector: label_selector(pairs),
            schedule: "*/30 * * * *".to_string(),
            backup_type,
            image_pull_secrets: None,
        },
    );
    p.metadata.namespace = Some(NAMESPACE.to_string());
    p.metadata.uid = Some(format!("uid-policy-{}", name));
    p.metadata.generation = Some(1);
    p
}

pub fn key(kind: WorkloadKind, name: &str) -> WorkloadRef {
    WorkloadRef::new(kind, NAMESPACE, name)
}

//! [`ClusterGateway`] backed by the Kubernetes API server

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Pod, ReplicationController, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ClusterGateway, WorkloadMutation, FIELD_MANAGER};
use crate::crd::{BackupPolicy, BackupPolicyStatus};
use crate::error::{Error, Result};
use crate::workload::{Workload, WorkloadKind, WorkloadRef};

/// Attempts made by `patch_workload` before giving up on write conflicts
const MAX_CONFLICT_ATTEMPTS: u32 = 5;

/// Gateway over a `kube::Client`
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn list_typed<K>(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<Workload>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Into<Workload>,
    {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        let list = self.api::<K>(namespace).list(&params).await?;
        Ok(list.items.into_iter().map(Into::into).collect())
    }

    async fn get_typed<K>(&self, target: &WorkloadRef) -> Result<Option<Workload>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Into<Workload>,
    {
        let api = self.api::<K>(Some(&target.namespace));
        Ok(api.get_opt(&target.name).await?.map(Into::into))
    }

    async fn patch_typed<K>(
        &self,
        target: &WorkloadRef,
        mutate: WorkloadMutation<'_>,
    ) -> Result<Workload>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug
            + Into<Workload>
            + TryFrom<Workload, Error = Error>,
    {
        let api = self.api::<K>(Some(&target.namespace));
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
            let current: Workload = api
                .get_opt(&target.name)
                .await?
                .ok_or_else(|| Error::NotFound(target.to_string()))?
                .into();
            let mut desired = current.clone();
            mutate(&mut desired)?;
            if desired == current {
                return Ok(current);
            }

            let obj = K::try_from(desired)?;
            match api.replace(&target.name, &params, &obj).await {
                Ok(updated) => return Ok(updated.into()),
                Err(kube::Error::Api(resp)) if resp.code == 409 => {
                    debug!(workload = %target, attempt, "Write conflict, retrying with a fresh read");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Conflict {
            target: target.to_string(),
            attempts: MAX_CONFLICT_ATTEMPTS,
        })
    }

    async fn apply_namespaced<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let namespace = meta
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let applied = api
            .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
            .await?;
        Ok(applied)
    }

    async fn delete_namespaced<K>(&self, namespace: &str, name: &str) -> Result<bool>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<Workload>> {
        match kind {
            WorkloadKind::Deployment => self.list_typed::<Deployment>(namespace, selector).await,
            WorkloadKind::ReplicaSet => self.list_typed::<ReplicaSet>(namespace, selector).await,
            WorkloadKind::ReplicationController => {
                self.list_typed::<ReplicationController>(namespace, selector)
                    .await
            }
            WorkloadKind::StatefulSet => self.list_typed::<StatefulSet>(namespace, selector).await,
            WorkloadKind::DaemonSet => self.list_typed::<DaemonSet>(namespace, selector).await,
        }
    }

    async fn get_workload(&self, target: &WorkloadRef) -> Result<Option<Workload>> {
        match target.kind {
            WorkloadKind::Deployment => self.get_typed::<Deployment>(target).await,
            WorkloadKind::ReplicaSet => self.get_typed::<ReplicaSet>(target).await,
            WorkloadKind::ReplicationController => {
                self.get_typed::<ReplicationController>(target).await
            }
            WorkloadKind::StatefulSet => self.get_typed::<StatefulSet>(target).await,
            WorkloadKind::DaemonSet => self.get_typed::<DaemonSet>(target).await,
        }
    }

    async fn patch_workload(
        &self,
        target: &WorkloadRef,
        mutate: WorkloadMutation<'_>,
    ) -> Result<Workload> {
        match target.kind {
            WorkloadKind::Deployment => self.patch_typed::<Deployment>(target, mutate).await,
            WorkloadKind::ReplicaSet => self.patch_typed::<ReplicaSet>(target, mutate).await,
            WorkloadKind::ReplicationController => {
                self.patch_typed::<ReplicationController>(target, mutate)
                    .await
            }
            WorkloadKind::StatefulSet => self.patch_typed::<StatefulSet>(target, mutate).await,
            WorkloadKind::DaemonSet => self.patch_typed::<DaemonSet>(target, mutate).await,
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delete_namespaced::<Pod>(namespace, name).await
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<BackupPolicy>> {
        let api: Api<BackupPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_policies(&self, namespace: Option<&str>) -> Result<Vec<BackupPolicy>> {
        let api = self.api::<BackupPolicy>(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupPolicyStatus,
    ) -> Result<()> {
        let api: Api<BackupPolicy> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        self.apply_namespaced(binding).await.map(|_| ())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delete_namespaced::<RoleBinding>(namespace, name).await
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        self.apply_namespaced(role).await.map(|_| ())
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        let name = role
            .metadata
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(role))
            .await?;
        Ok(())
    }

    async fn apply_service_account(&self, account: &ServiceAccount) -> Result<()> {
        self.apply_namespaced(account).await.map(|_| ())
    }

    async fn apply_cron_job(&self, job: &CronJob) -> Result<CronJob> {
        self.apply_namespaced(job).await
    }

    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delete_namespaced::<CronJob>(namespace, name).await
    }
}

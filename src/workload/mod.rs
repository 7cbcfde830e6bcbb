//! Workload model
//!
//! The five pod-managing kinds the operator understands are represented as a
//! closed set of variants behind one set of capability methods. Daemon sets
//! have no replica count and stateful sets are never scaled, so
//! [`Workload::set_replicas`] is a no-op for both.

mod state;

pub use state::*;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::selector::{self, Selector};

/// Supported workload kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    ReplicaSet,
    ReplicationController,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    /// Every supported kind
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::Deployment,
        WorkloadKind::ReplicaSet,
        WorkloadKind::ReplicationController,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
    ];

    /// Kinds the scale orchestrator drives to zero replicas
    pub const SCALABLE: [WorkloadKind; 3] = [
        WorkloadKind::Deployment,
        WorkloadKind::ReplicationController,
        WorkloadKind::ReplicaSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::ReplicationController => "ReplicationController",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            WorkloadKind::ReplicationController => "v1",
            _ => "apps/v1",
        }
    }

    /// Whether the orchestrator scales this kind to zero
    pub fn is_scalable(&self) -> bool {
        Self::SCALABLE.contains(self)
    }

    /// Whether the platform rolls pods by itself after a pod template change.
    /// Replica sets and replication controllers only apply a new template
    /// to pods created after the change.
    pub fn rolls_out_template_changes(&self) -> bool {
        !matches!(
            self,
            WorkloadKind::ReplicaSet | WorkloadKind::ReplicationController
        )
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(WorkloadKind::Deployment),
            "replicaset" | "replicasets" | "rs" => Ok(WorkloadKind::ReplicaSet),
            "replicationcontroller" | "replicationcontrollers" | "rc" => {
                Ok(WorkloadKind::ReplicationController)
            }
            "statefulset" | "statefulsets" | "sts" => Ok(WorkloadKind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Ok(WorkloadKind::DaemonSet),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

/// Reference to a workload; also the work queue key for workloads
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A workload object of one of the supported kinds
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    Deployment(Deployment),
    ReplicaSet(ReplicaSet),
    ReplicationController(ReplicationController),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

macro_rules! workload_conversions {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Workload {
                fn from(obj: $variant) -> Self {
                    Workload::$variant(obj)
                }
            }

            impl TryFrom<Workload> for $variant {
                type Error = Error;

                fn try_from(w: Workload) -> Result<Self> {
                    match w {
                        Workload::$variant(obj) => Ok(obj),
                        other => Err(Error::UnknownKind(format!(
                            "expected {}, got {}",
                            stringify!($variant),
                            other.kind()
                        ))),
                    }
                }
            }
        )*
    };
}

workload_conversions!(
    Deployment,
    ReplicaSet,
    ReplicationController,
    StatefulSet,
    DaemonSet
);

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::ReplicaSet(_) => WorkloadKind::ReplicaSet,
            Workload::ReplicationController(_) => WorkloadKind::ReplicationController,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::DaemonSet(_) => WorkloadKind::DaemonSet,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(o) => &o.metadata,
            Workload::ReplicaSet(o) => &o.metadata,
            Workload::ReplicationController(o) => &o.metadata,
            Workload::StatefulSet(o) => &o.metadata,
            Workload::DaemonSet(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::Deployment(o) => &mut o.metadata,
            Workload::ReplicaSet(o) => &mut o.metadata,
            Workload::ReplicationController(o) => &mut o.metadata,
            Workload::StatefulSet(o) => &mut o.metadata,
            Workload::DaemonSet(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or("default")
    }

    pub fn reference(&self) -> WorkloadRef {
        WorkloadRef::new(self.kind(), self.namespace(), self.name())
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().labels.as_ref()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.metadata_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
    }

    /// Remove an annotation, returning its previous value
    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        self.metadata_mut()
            .annotations
            .as_mut()
            .and_then(|a| a.remove(key))
    }

    /// Desired replica count; `None` for daemon sets. An unset count on the
    /// other kinds is defaulted to 1 by the API server.
    pub fn replicas(&self) -> Option<i32> {
        let replicas = match self {
            Workload::Deployment(o) => o.spec.as_ref().map(|s| s.replicas),
            Workload::ReplicaSet(o) => o.spec.as_ref().map(|s| s.replicas),
            Workload::ReplicationController(o) => o.spec.as_ref().map(|s| s.replicas),
            Workload::StatefulSet(o) => o.spec.as_ref().map(|s| s.replicas),
            Workload::DaemonSet(_) => return None,
        };
        Some(replicas.flatten().unwrap_or(1))
    }

    /// Set the desired replica count. Returns `false` without touching the
    /// object for kinds the operator never scales (stateful set, daemon set).
    pub fn set_replicas(&mut self, replicas: i32) -> bool {
        match self {
            Workload::Deployment(o) => {
                o.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            Workload::ReplicaSet(o) => {
                o.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            Workload::ReplicationController(o) => {
                o.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            Workload::StatefulSet(_) | Workload::DaemonSet(_) => return false,
        }
        true
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::Deployment(o) => o.spec.as_ref().map(|s| &s.template),
            Workload::ReplicaSet(o) => o.spec.as_ref().and_then(|s| s.template.as_ref()),
            Workload::ReplicationController(o) => {
                o.spec.as_ref().and_then(|s| s.template.as_ref())
            }
            Workload::StatefulSet(o) => o.spec.as_ref().map(|s| &s.template),
            Workload::DaemonSet(o) => o.spec.as_ref().map(|s| &s.template),
        }
    }

    pub fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        match self {
            Workload::Deployment(o) => &mut o.spec.get_or_insert_with(Default::default).template,
            Workload::ReplicaSet(o) => o
                .spec
                .get_or_insert_with(Default::default)
                .template
                .get_or_insert_with(Default::default),
            Workload::ReplicationController(o) => o
                .spec
                .get_or_insert_with(Default::default)
                .template
                .get_or_insert_with(Default::default),
            Workload::StatefulSet(o) => &mut o.spec.get_or_insert_with(Default::default).template,
            Workload::DaemonSet(o) => &mut o.spec.get_or_insert_with(Default::default).template,
        }
    }

    /// Service account the workload's pods run as
    pub fn service_account(&self) -> String {
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.service_account_name.clone())
            .filter(|sa| !sa.is_empty())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.metadata().owner_references.as_deref().unwrap_or_default()
    }

    /// Replica sets created by a deployment are handled through the deployment
    pub fn is_owned_by_deployment(&self) -> bool {
        self.owner_references()
            .iter()
            .any(|r| r.kind == WorkloadKind::Deployment.as_str())
    }

    /// Owner reference pointing at this workload, for garbage collection of
    /// objects created on its behalf
    pub fn owner_reference(&self) -> Result<OwnerReference> {
        let meta = self.metadata();
        Ok(OwnerReference {
            api_version: self.kind().api_version().to_string(),
            kind: self.kind().as_str().to_string(),
            name: meta
                .name
                .clone()
                .ok_or(Error::MissingObjectKey(".metadata.name"))?,
            uid: meta
                .uid
                .clone()
                .ok_or(Error::MissingObjectKey(".metadata.uid"))?,
            block_owner_deletion: None,
            controller: None,
        })
    }

    /// Label selector (query form) for the pods this workload manages
    pub fn pod_selector(&self) -> Result<String> {
        let rendered = match self {
            Workload::Deployment(o) => o
                .spec
                .as_ref()
                .map(|s| selector::compile(&s.selector))
                .transpose()?
                .map(|s| s.to_string()),
            Workload::ReplicaSet(o) => o
                .spec
                .as_ref()
                .map(|s| selector::compile(&s.selector))
                .transpose()?
                .map(|s| s.to_string()),
            Workload::StatefulSet(o) => o
                .spec
                .as_ref()
                .map(|s| selector::compile(&s.selector))
                .transpose()?
                .map(|s| s.to_string()),
            Workload::DaemonSet(o) => o
                .spec
                .as_ref()
                .map(|s| selector::compile(&s.selector))
                .transpose()?
                .map(|s| s.to_string()),
            Workload::ReplicationController(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .map(|labels| labels.clone().into_iter().collect::<Selector>().to_string()),
        };
        match rendered {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(Error::MissingObjectKey(".spec.selector")),
        }
    }
}

/// Pods of daemon sets and stateful sets are never removed by scaling
pub fn is_daemon_or_stateful_set_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|r| {
            r.kind == WorkloadKind::StatefulSet.as_str()
                || r.kind == WorkloadKind::DaemonSet.as_str()
        })
}

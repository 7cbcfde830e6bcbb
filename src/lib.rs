//! OSO Workload Backup Kubernetes Operator
//!
//! This operator attaches backup behaviour to running workloads. A
//! `BackupPolicy` selects Deployments, ReplicaSets, ReplicationControllers,
//! StatefulSets and DaemonSets by label; the operator injects a backup
//! component into each of them, grants it the access it needs, and drives
//! the scale-down/scale-up cycle that offline backups rely on.

pub mod admission;
pub mod cache;
pub mod commands;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod gateway;
pub mod metrics;
pub mod queue;
pub mod rbac;
pub mod reconcilers;
pub mod scale;
pub mod selector;
pub mod sidecar;
pub mod workload;

pub use error::{Error, Result};

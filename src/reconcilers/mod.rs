//! Reconcilers for BackupPolicy resources and selected workloads
//!
//! This module contains the business logic of the operator. Reconcilers are
//! responsible for:
//! - Validating policies and reporting their status
//! - Injecting and removing the backup component
//! - Restoring replica counts left behind by interrupted scale runs
//! - Keeping the scheduled scale-down job of offline policies in place

pub mod cronjob;
pub mod policy;
pub mod workload;

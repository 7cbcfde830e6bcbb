//! Operator events
//!
//! Warnings and notable transitions are reported against the object they
//! concern. Events are emitted as structured log lines and counted.

use tracing::{info, warn};

use crate::metrics;

pub const REASON_INVALID_POLICY: &str = "InvalidBackupPolicy";
pub const REASON_MULTIPLE_POLICIES: &str = "MultipleBackupPolicies";
pub const REASON_INVALID_MARKER: &str = "InvalidAnnotation";
pub const REASON_SIDECAR_INJECTED: &str = "SidecarInjected";
pub const REASON_SIDECAR_REMOVED: &str = "SidecarRemoved";
pub const REASON_REPLICAS_RESTORED: &str = "ReplicasRestored";
pub const REASON_POD_RESTART_FAILED: &str = "PodRestartFailed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Sink for operator events
#[derive(Clone, Debug, Default)]
pub struct EventRecorder;

impl EventRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record an event against `object` (a `kind/namespace/name` reference)
    pub fn publish(&self, object: &str, event_type: EventType, reason: &str, message: &str) {
        metrics::EVENTS
            .with_label_values(&[event_type.as_str(), reason])
            .inc();
        match event_type {
            EventType::Normal => info!(object = %object, reason = %reason, "{}", message),
            EventType::Warning => warn!(object = %object, reason = %reason, "{}", message),
        }
    }

    pub fn warning(&self, object: &str, reason: &str, message: &str) {
        self.publish(object, EventType::Warning, reason, message);
    }

    pub fn normal(&self, object: &str, reason: &str, message: &str) {
        self.publish(object, EventType::Normal, reason, message);
    }
}

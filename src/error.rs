//! Error types for the Workload Backup Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Label selector could not be compiled
    #[error("Invalid label selector: {0}")]
    Selector(String),

    /// Workload kind outside the supported set
    #[error("Unknown workload kind: {0}")]
    UnknownKind(String),

    /// An annotation written by the operator could not be decoded
    #[error("Invalid annotation '{key}': {reason}")]
    InvalidAnnotation { key: String, reason: String },

    /// Object is missing a field the operator depends on
    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),

    /// Object not found in the cluster
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency retries exhausted
    #[error("Conflict persisted after {attempts} attempts updating {target}")]
    Conflict { target: String, attempts: u32 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a selector error
    pub fn selector(msg: impl Into<String>) -> Self {
        Error::Selector(msg.into())
    }

    /// Create an annotation decoding error
    pub fn invalid_annotation(key: &str, reason: impl Into<String>) -> Self {
        Error::InvalidAnnotation {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the work queue should retry the key with backoff.
    ///
    /// Cluster and transport failures converge on retry. Validation-class
    /// failures cannot be fixed by retrying and are only reported.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => !matches!(resp.code, 400 | 403 | 422),
            Error::Kube(_) | Error::Conflict { .. } | Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// Whether this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }
}

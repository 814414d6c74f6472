//! Error types for the EMQX Kubernetes Operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// The cluster or plugin spec contradicts itself; retrying cannot help
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Lost an optimistic-concurrency race with another writer
    #[error("Conflict on {kind}/{name}: {message}")]
    ConflictError {
        kind: String,
        name: String,
        message: String,
    },

    /// Platform-side transient, quota or permission failure
    #[error("Resource error: {0}")]
    ResourceError(String),

    /// A broker member could not be reached
    #[error("Member {member} unreachable: {message}")]
    ConnectivityError { member: String, message: String },

    /// A broker member answered but rejected the request
    #[error("Member {member} rejected request: {message}")]
    AdminApiError { member: String, message: String },

    /// Kubernetes API error that did not map onto a more specific class
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// The pass observed the shutdown signal
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Classify a Kubernetes client error into the operator taxonomy.
    ///
    /// `kind` and `name` identify the object the call was about and end up
    /// in conflict messages.
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 409 => OperatorError::ConflictError {
                kind: kind.to_string(),
                name: name.to_string(),
                message: ae.message.clone(),
            },
            kube::Error::Api(ref ae) if ae.code == 404 => OperatorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: String::new(),
            },
            kube::Error::Api(ref ae)
                if matches!(ae.code, 403 | 422 | 429) || ae.code >= 500 =>
            {
                OperatorError::ResourceError(format!(
                    "{} {}/{}: {} ({})",
                    ae.code, kind, name, ae.message, ae.reason
                ))
            }
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                OperatorError::ResourceError(format!("{}/{}: {}", kind, name, err))
            }
            other => OperatorError::KubeError(other),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::ConflictError { .. }
                | OperatorError::ResourceError(_)
                | OperatorError::ConnectivityError { .. }
                | OperatorError::KubeError(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors.
    ///
    /// Resource errors return `None` here because their delay grows with
    /// the per-cluster retry count; see the controller's error policy.
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::ConflictError { .. } => Some(Duration::from_secs(1)),
            OperatorError::ConnectivityError { .. } => Some(Duration::from_secs(10)),
            OperatorError::KubeError(_) => Some(Duration::from_secs(30)),
            _ => None,
        }
    }

    /// Machine-readable reason recorded on the `Reconciled` condition
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::ValidationError(_) => "ValidationFailed",
            OperatorError::ConflictError { .. } => "Conflict",
            OperatorError::ResourceError(_) => "ResourceError",
            OperatorError::ConnectivityError { .. } => "MemberUnreachable",
            OperatorError::AdminApiError { .. } => "MemberRejected",
            OperatorError::KubeError(_) | OperatorError::NotFound { .. } => "KubernetesError",
            OperatorError::SerializationError(_) | OperatorError::YamlError(_) => {
                "SerializationFailed"
            }
            OperatorError::Cancelled => "Cancelled",
            OperatorError::Internal(_) => "InternalError",
        }
    }
}

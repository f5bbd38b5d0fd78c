//! Error types for the Integreatly operator

use crate::providers::ProviderError;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification shared by control-plane and cloud-provider errors.
///
/// `AlreadyExists` and `NotFound` are idempotency sentinels: they tell the
/// caller the world is already in (or past) the state it asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The resource being created is already present
    AlreadyExists,
    /// The resource being removed or read is absent
    NotFound,
    /// Network, API or contention failure; retry later
    Transient,
    /// The request itself was rejected; retry only after something changes
    Unrecoverable,
}

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource already exists
    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Optimistic concurrency conflict (stale resourceVersion)
    #[error("Conflicting write to {kind}/{name}, object was modified concurrently")]
    Conflict { kind: String, name: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Cloud provider error
    #[error("Cloud provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Map a Kubernetes API error onto the structured taxonomy.
    ///
    /// Discrimination uses the HTTP status code and the API `reason` field,
    /// never the human-readable message.
    pub fn from_kube(error: kube::Error, kind: &str, name: &str, namespace: &str) -> Self {
        match &error {
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                OperatorError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => OperatorError::KubeError(error),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            OperatorError::NotFound { .. } => ErrorKind::NotFound,
            OperatorError::KubeError(kube::Error::Api(ae)) if (400..500).contains(&ae.code) => {
                match ae.code {
                    // throttled or timed out on the server side
                    408 | 429 => ErrorKind::Transient,
                    _ => ErrorKind::Unrecoverable,
                }
            }
            OperatorError::KubeError(_)
            | OperatorError::Conflict { .. }
            | OperatorError::Timeout(_)
            | OperatorError::ReconcileFailed(_) => ErrorKind::Transient,
            OperatorError::Provider(e) => e.kind(),
            OperatorError::InvalidConfig(_)
            | OperatorError::ValidationError(_)
            | OperatorError::SerializationError(_)
            | OperatorError::YamlError(_)
            | OperatorError::Internal(_) => ErrorKind::Unrecoverable,
        }
    }

    /// Check if this error is retryable without any outside change
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::Conflict { .. } => Some(Duration::from_secs(1)),
            _ if self.is_retryable() => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "irrelevant".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_error_display() {
        let err = OperatorError::NotFound {
            kind: "Namespace".to_string(),
            name: "intly-amq-streams".to_string(),
            namespace: "".to_string(),
        };
        assert!(err.to_string().contains("Namespace"));
        assert!(err.to_string().contains("intly-amq-streams"));
    }

    #[test]
    fn test_from_kube_already_exists() {
        let err = OperatorError::from_kube(api_error(409, "AlreadyExists"), "Kafka", "x", "ns");
        assert!(matches!(err, OperatorError::AlreadyExists { .. }));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_from_kube_conflict_is_transient() {
        let err = OperatorError::from_kube(api_error(409, "Conflict"), "Installation", "x", "ns");
        assert!(matches!(err, OperatorError::Conflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.requeue_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_from_kube_not_found() {
        let err = OperatorError::from_kube(api_error(404, "NotFound"), "Namespace", "x", "");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_rejected_request_is_unrecoverable() {
        let err = OperatorError::from_kube(api_error(422, "Invalid"), "Kafka", "x", "ns");
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);

        let throttled = OperatorError::from_kube(api_error(429, "TooManyRequests"), "Kafka", "x", "ns");
        assert_eq!(throttled.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_requeue_delay() {
        let retryable = OperatorError::Timeout("test".to_string());
        assert!(retryable.requeue_delay().is_some());

        let not_retryable = OperatorError::InvalidConfig("test".to_string());
        assert!(not_retryable.requeue_delay().is_none());
    }
}

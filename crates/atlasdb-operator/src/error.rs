//! Error types for the AtlasDB Kubernetes Operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Object expected to exist is missing from the store
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Create raced with another writer
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Write carried a stale resource version
    #[error("Conflict writing {kind}/{name} in namespace {namespace}: {message}")]
    Conflict {
        kind: String,
        name: String,
        namespace: String,
        message: String,
    },

    /// A secret the cluster depends on lacks a required key
    #[error("Secret {namespace}/{name} has no '{key}' key")]
    MissingSecretKey {
        name: String,
        namespace: String,
        key: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Manifest could not be read or rendered as YAML
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Object store unavailable or failed for a reason outside the taxonomy above
    #[error("Object store error: {0}")]
    StoreError(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Conflict { .. }
                | OperatorError::AlreadyExists { .. }
                | OperatorError::StoreError(_)
                | OperatorError::FinalizerError(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            // Another writer won; re-read and try again almost immediately.
            OperatorError::Conflict { .. } | OperatorError::AlreadyExists { .. } => {
                Some(Duration::from_secs(1))
            }
            e if e.is_retryable() => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::NotFound {
            kind: "StatefulSet".to_string(),
            name: "pg1".to_string(),
            namespace: "default".to_string(),
        };
        assert!(err.to_string().contains("StatefulSet"));
        assert!(err.to_string().contains("pg1"));
    }

    #[test]
    fn test_retryable_errors() {
        let conflict = OperatorError::Conflict {
            kind: "Secret".to_string(),
            name: "pg1-connection".to_string(),
            namespace: "a".to_string(),
            message: "stale resourceVersion".to_string(),
        };
        assert!(conflict.is_retryable());
        assert!(OperatorError::StoreError("unavailable".to_string()).is_retryable());

        let missing = OperatorError::MissingSecretKey {
            name: "pg1-superuser".to_string(),
            namespace: "a".to_string(),
            key: "password".to_string(),
        };
        assert!(!missing.is_retryable());
        assert!(!OperatorError::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        let conflict = OperatorError::AlreadyExists {
            kind: "Service".to_string(),
            name: "pg1-rw".to_string(),
            namespace: "a".to_string(),
        };
        assert_eq!(conflict.requeue_delay(), Some(Duration::from_secs(1)));

        let transient = OperatorError::StoreError("timeout".to_string());
        assert_eq!(transient.requeue_delay(), Some(Duration::from_secs(30)));

        let not_retryable = OperatorError::InvalidConfig("test".to_string());
        assert!(not_retryable.requeue_delay().is_none());
    }
}

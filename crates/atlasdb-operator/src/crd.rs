//! Custom Resource Definitions for the AtlasDB Kubernetes Operator
//!
//! This module defines the `PostgresCluster` CRD: the user-declared shape of a
//! managed PostgreSQL cluster plus the status the operator reports back.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating container image tags
static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate the engine version, which doubles as the image tag
fn validate_version(value: &str) -> Result<(), ValidationError> {
    if TAG_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_version")
            .with_message(format!("'{}' is not a valid image tag", value).into()))
    }
}

/// Validate a Kubernetes name (RFC 1123)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty means "derive from the cluster name"
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// PostgresCluster custom resource definition
///
/// Represents a managed PostgreSQL cluster. The operator watches these
/// resources and converges a StatefulSet, two Services and two Secrets
/// towards the declared shape.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "databases.atlasdb.io",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".status.endpoint"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Desired number of PostgreSQL instances (0-100)
    #[serde(default = "default_instances")]
    #[validate(range(min = 0, max = 100, message = "instances must be between 0 and 100"))]
    pub instances: i32,

    /// PostgreSQL version, used as the `postgres` image tag
    #[serde(default = "default_version")]
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    #[validate(custom(function = "validate_version"))]
    pub version: String,

    /// Size of each instance's data volume (e.g., "10Gi")
    #[serde(default = "default_storage_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub storage_size: String,

    /// Name of the superuser credential secret; empty derives `<cluster>-superuser`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub superuser_secret_name: Option<String>,
}

/// Status of a PostgresCluster resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Conditions describing cluster state, unique by type
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Client endpoint address, published once the cluster is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name of the secret holding connection info
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_secret_name: Option<String>,

    /// Generation observed by the reconciliation that wrote this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Phase of the cluster lifecycle
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Child resources are being created or pods are not all ready
    #[default]
    Reconciling,
    /// Every declared instance reports ready
    Ready,
}

/// Tri-state status of a condition
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition describing an aspect of cluster state
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason for the last transition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// RFC 3339 time of the last status change
    pub last_transition_time: String,

    /// Generation the condition was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

// Default value functions
fn default_instances() -> i32 {
    1
}

fn default_version() -> String {
    "16".to_string()
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

impl PostgresClusterSpec {
    /// Get the container image for the declared version
    pub fn get_image(&self) -> String {
        format!("postgres:{}", self.version)
    }

    /// Superuser secret override, with empty strings treated as absent
    pub fn superuser_secret_override(&self) -> Option<&str> {
        self.superuser_secret_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Get labels for managed resources
    pub fn get_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(cluster_name);
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            "database".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "atlasdb-operator".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            self.version.clone(),
        );
        labels
    }

    /// Get selector labels for managed resources
    pub fn get_selector_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "postgres".to_string());
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        );
        labels
    }
}

impl PostgresCluster {
    /// Whether the object carries a deletion marker
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is registered on the object
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|name| name == finalizer))
    }
}

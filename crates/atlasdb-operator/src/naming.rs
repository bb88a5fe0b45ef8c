//! Deterministic names for everything the operator manages.
//!
//! Every child of a `PostgresCluster` is looked up by a name derived only
//! from the cluster's `(namespace, name)` identity (and the optional superuser
//! secret override). Nothing else in the crate concatenates child names.

use crate::crd::PostgresCluster;
use crate::error::{OperatorError, Result};
use kube::ResourceExt;

/// Port PostgreSQL listens on, in the container and on both Services
pub const POSTGRES_PORT: i32 = 5432;

/// Name of the container and of the named ports
pub const POSTGRES_PORT_NAME: &str = "postgres";

/// Fixed superuser account name stored in the credential secret
pub const SUPERUSER_USERNAME: &str = "postgres";

/// Database name published in the connection info
pub const DEFAULT_DATABASE: &str = "postgres";

/// DNS suffix for Services inside the cluster
pub const DEFAULT_CLUSTER_DOMAIN: &str = "svc.cluster.local";

const CLIENT_SERVICE_SUFFIX: &str = "-rw";
const SUPERUSER_SECRET_SUFFIX: &str = "-superuser";
const CONNECTION_SECRET_SUFFIX: &str = "-connection";

/// Child-resource names for one cluster identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    namespace: String,
    cluster: String,
    superuser_secret: String,
}

impl ClusterNames {
    /// Names for `(namespace, cluster)`, honouring a superuser secret override
    pub fn new(namespace: &str, cluster: &str, superuser_override: Option<&str>) -> Self {
        let superuser_secret = match superuser_override {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}{}", cluster, SUPERUSER_SECRET_SUFFIX),
        };
        Self {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            superuser_secret,
        }
    }

    /// Names for a cluster object; fails if the object has no name or namespace
    pub fn for_cluster(cluster: &PostgresCluster) -> Result<Self> {
        let name = cluster
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| OperatorError::InvalidConfig("cluster name is required".to_string()))?;
        let namespace = cluster.namespace().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("cluster '{}' has no namespace", name))
        })?;
        Ok(Self::new(
            &namespace,
            name,
            cluster.spec.superuser_secret_override(),
        ))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// StatefulSet name
    pub fn workload(&self) -> String {
        self.cluster.clone()
    }

    /// Headless Service name; also the StatefulSet's `serviceName`
    pub fn headless_service(&self) -> String {
        self.cluster.clone()
    }

    /// Client-facing read-write Service name
    pub fn client_service(&self) -> String {
        format!("{}{}", self.cluster, CLIENT_SERVICE_SUFFIX)
    }

    /// Superuser credential secret name
    pub fn superuser_secret(&self) -> String {
        self.superuser_secret.clone()
    }

    /// Connection-info secret name
    pub fn connection_secret(&self) -> String {
        format!("{}{}", self.cluster, CONNECTION_SECRET_SUFFIX)
    }

    /// Externally reachable `host:port` of the client Service
    pub fn endpoint(&self, cluster_domain: &str) -> String {
        format!(
            "{}.{}.{}:{}",
            self.client_service(),
            self.namespace,
            cluster_domain,
            POSTGRES_PORT
        )
    }
}

//! Operator configuration
//!
//! Timing constants are fixed delays rather than backoff: the engine asks to be
//! re-invoked after a short settle time when it has just created something, and
//! polls on a steady interval while pods come up.

use crate::naming::DEFAULT_CLUSTER_DOMAIN;
use std::time::Duration;

/// Settle time after creating the StatefulSet
pub const WORKLOAD_SETTLE: Duration = Duration::from_secs(3);

/// Settle time after creating a Service
pub const SERVICE_SETTLE: Duration = Duration::from_secs(2);

/// Poll interval while the StatefulSet is not fully ready
pub const READINESS_POLL: Duration = Duration::from_secs(5);

/// Runtime configuration shared by every reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// DNS suffix used to build the published endpoint
    pub cluster_domain: String,
    /// Delay requested after creating the StatefulSet
    pub workload_settle: Duration,
    /// Delay requested after creating a Service
    pub service_settle: Duration,
    /// Delay requested while waiting for ready replicas
    pub readiness_poll: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            workload_settle: WORKLOAD_SETTLE,
            service_settle: SERVICE_SETTLE,
            readiness_poll: READINESS_POLL,
        }
    }
}

impl OperatorConfig {
    /// Override the cluster DNS suffix; blank input keeps the default
    pub fn with_cluster_domain(mut self, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        let trimmed = domain.trim().trim_matches('.');
        if !trimmed.is_empty() {
            self.cluster_domain = trimmed.to_string();
        }
        self
    }
}

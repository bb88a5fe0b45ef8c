//! # AtlasDB Kubernetes Operator
//!
//! Kubernetes operator that turns a `PostgresCluster` custom resource into a
//! running PostgreSQL deployment: a StatefulSet, a headless and a client
//! Service, a generated superuser secret, and a connection-info secret.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use atlasdb_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, OperatorConfig::default(), Readiness::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Each reconciliation pass re-reads the cluster and walks a fixed sequence:
//!
//! 1. **Finalizer**: register the finalizer, or release it when deleting
//! 2. **Credentials**: generate the superuser secret once
//! 3. **Children**: create the StatefulSet and Services when absent, stopping
//!    after each creation to let it settle
//! 4. **Connection info**: re-derive the connection secret
//! 5. **Status**: publish phase, `Ready` condition and endpoint
//!
//! All store access goes through [`store::ObjectStore`], with
//! [`store::KubeStore`] for the API server and [`store::MemoryStore`] for
//! tests and [`dry_run`] rendering.
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: databases.atlasdb.io/v1alpha1
//! kind: PostgresCluster
//! metadata:
//!   name: orders
//!   namespace: shop
//! spec:
//!   instances: 3
//!   version: "16"
//!   storageSize: 10Gi
//! ```
//!
//! ## Metrics
//!
//! - `atlasdb_operator_reconciliations_total` - Total reconciliation attempts
//! - `atlasdb_operator_reconciliation_errors_total` - Reconciliation errors
//! - `atlasdb_operator_reconciliation_duration_seconds` - Reconciliation latency

pub mod config;
pub mod controller;
pub mod credentials;
pub mod crd;
pub mod dry_run;
pub mod error;
pub mod finalizer;
pub mod health;
pub mod naming;
pub mod resources;
pub mod status;
pub mod store;
pub mod upsert;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, ErrorBackoff, ReconcileOutcome,
        Reconciler,
    };
    pub use crate::crd::{
        ClusterCondition, ClusterPhase, ConditionStatus, PostgresCluster, PostgresClusterSpec,
        PostgresClusterStatus,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::health::Readiness;
    pub use crate::naming::ClusterNames;
    pub use crate::resources::ResourceBuilder;
    pub use crate::store::{KubeStore, MemoryStore, ObjectStore};
}

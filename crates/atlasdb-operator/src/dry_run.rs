//! Offline rendering of what a PostgresCluster manifest converges to.
//!
//! The manifest is loaded into a [`MemoryStore`] and the reconciler is run
//! until a pass changes nothing, which is as far as a cluster can get without
//! pods reporting ready. The resulting objects are printed as YAML documents.

use crate::config::OperatorConfig;
use crate::controller::{ReconcileOutcome, Reconciler};
use crate::crd::PostgresCluster;
use crate::error::{OperatorError, Result};
use crate::store::{MemoryStore, ObjectStore};
use kube::ResourceExt;
use tracing::{debug, info};

/// Namespace assumed when the manifest does not set one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Upper bound on reconciliation passes per render
pub const MAX_PASSES: usize = 16;

/// Render every object the operator would create for `manifest`
pub async fn render(manifest: &str, config: OperatorConfig) -> Result<String> {
    let mut cluster: PostgresCluster = serde_yaml::from_str(manifest)?;
    let name = cluster.metadata.name.clone().ok_or_else(|| {
        OperatorError::InvalidConfig("PostgresCluster manifest has no metadata.name".to_string())
    })?;
    let namespace = cluster
        .namespace()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    cluster.metadata.namespace = Some(namespace.clone());

    let reconciler = Reconciler::new(MemoryStore::new(), config);
    let store = reconciler.store();
    store.create(&cluster).await?;

    for pass in 1..=MAX_PASSES {
        let writes = store.write_count();
        let outcome = reconciler.reconcile(&namespace, &name).await?;
        debug!(pass, ?outcome, "Dry-run pass finished");
        if outcome == ReconcileOutcome::Converged || store.write_count() == writes {
            break;
        }
    }

    info!(%namespace, %name, objects = store.len(), "Rendered cluster");

    let mut out = String::new();
    for document in store.documents() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&document)?);
    }
    Ok(out)
}

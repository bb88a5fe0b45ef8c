//! Finalizer handling for PostgresCluster resources.
//!
//! The finalizer gives the operator one last pass before the cluster object
//! leaves the store. Children are owned through controller references and
//! are garbage-collected by the store, so the cleanup step itself is empty.

use crate::crd::PostgresCluster;
use crate::error::{OperatorError, Result};
use crate::store::ObjectStore;
use kube::ResourceExt;
use tracing::{debug, info};

/// Finalizer name for PostgresCluster resources
pub const FINALIZER_NAME: &str = "databases.atlasdb.io/finalizer";

/// What the finalizer state machine wants done for an observed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerAction {
    /// Live object without our finalizer
    Add,
    /// Deleting object still holding our finalizer
    Remove,
    /// Live object already registered
    Keep,
    /// Deleting object we have already released
    Released,
}

/// How a reconciliation should continue after the finalizer step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizerOutcome {
    /// Nothing was written; carry on with the live object
    Continue,
    /// The object was written; stop and wait for the resulting trigger
    Persisted,
    /// The object is going away; do nothing else
    Deleting,
}

/// Decide from deletion marker × finalizer presence
pub fn finalizer_action(cluster: &PostgresCluster) -> FinalizerAction {
    match (cluster.is_deleting(), cluster.has_finalizer(FINALIZER_NAME)) {
        (false, false) => FinalizerAction::Add,
        (false, true) => FinalizerAction::Keep,
        (true, true) => FinalizerAction::Remove,
        (true, false) => FinalizerAction::Released,
    }
}

/// Run the finalizer state machine, persisting any change
pub async fn reconcile_finalizer<S: ObjectStore>(
    store: &S,
    cluster: &PostgresCluster,
) -> Result<FinalizerOutcome> {
    let name = cluster.name_any();

    match finalizer_action(cluster) {
        FinalizerAction::Keep => Ok(FinalizerOutcome::Continue),
        FinalizerAction::Released => {
            debug!(name = %name, "Finalizer already released, waiting for removal");
            Ok(FinalizerOutcome::Deleting)
        }
        FinalizerAction::Add => {
            info!(name = %name, "Adding finalizer");
            let mut updated = cluster.clone();
            updated
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER_NAME.to_string());
            store.update(&updated).await.map_err(persist_error)?;
            Ok(FinalizerOutcome::Persisted)
        }
        FinalizerAction::Remove => {
            info!(name = %name, "Cluster is being deleted, running cleanup");
            cleanup(cluster);

            let mut updated = cluster.clone();
            if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER_NAME);
            }
            store.update(&updated).await.map_err(persist_error)?;
            info!(name = %name, "Finalizer removed");
            Ok(FinalizerOutcome::Persisted)
        }
    }
}

/// Controller-side cleanup before the object disappears
///
/// Every child carries a controller reference, so the store's cascade removes
/// them; there is nothing for the operator to delete itself.
fn cleanup(cluster: &PostgresCluster) {
    debug!(
        name = %cluster.name_any(),
        "Children are garbage-collected through owner references"
    );
}

/// Conflicts stay retryable conflicts; anything else becomes a finalizer error
fn persist_error(err: OperatorError) -> OperatorError {
    match err {
        e @ OperatorError::Conflict { .. } => e,
        e => OperatorError::FinalizerError(e.to_string()),
    }
}

//! PostgresCluster Controller
//!
//! This module implements the reconciliation engine for PostgresCluster
//! resources and wires it into a kube-runtime controller. Each pass is a pure
//! function of what the store currently holds: it re-checks every child by its
//! deterministic name instead of remembering what an earlier pass did, so a
//! pass abandoned halfway is safely redone from the top.

use crate::config::OperatorConfig;
use crate::credentials::{ensure_credential, ConnectionInfo};
use crate::crd::{ClusterPhase, PostgresCluster, PostgresClusterStatus};
use crate::error::{OperatorError, Result};
use crate::finalizer::{reconcile_finalizer, FinalizerOutcome};
use crate::health::Readiness;
use crate::resources::ResourceBuilder;
use crate::status::{apply_readiness, WorkloadReadiness};
use crate::store::{KubeStore, ObjectStore, StoreObject};
use crate::upsert::upsert;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller, Error as ControllerError};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Label selector for children the operator manages
const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=atlasdb-operator";

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the next external trigger
    Converged,
    /// Not converged yet; run again after the given delay
    RequeueAfter(Duration),
}

impl ReconcileOutcome {
    pub fn into_action(self) -> Action {
        match self {
            ReconcileOutcome::Converged => Action::await_change(),
            ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Reconciliation engine for PostgresCluster objects
pub struct Reconciler<S> {
    store: S,
    config: OperatorConfig,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, config: OperatorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run one pass for the cluster identified by `(namespace, name)`
    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some(cluster) = self.store.get::<PostgresCluster>(namespace, name).await? else {
            debug!("PostgresCluster no longer exists");
            return Ok(ReconcileOutcome::Converged);
        };

        match reconcile_finalizer(&self.store, &cluster).await? {
            FinalizerOutcome::Continue => {}
            FinalizerOutcome::Persisted if !cluster.is_deleting() => {
                return Ok(ReconcileOutcome::RequeueAfter(Duration::ZERO));
            }
            FinalizerOutcome::Persisted | FinalizerOutcome::Deleting => {
                return Ok(ReconcileOutcome::Converged);
            }
        }

        validate_cluster(&cluster)?;
        self.apply_cluster(&cluster).await
    }

    /// Converge children and status of a live, finalized cluster
    async fn apply_cluster(&self, cluster: &PostgresCluster) -> Result<ReconcileOutcome> {
        let builder = ResourceBuilder::new(cluster)?;
        let names = builder.names();
        let namespace = names.namespace();

        let credential = ensure_credential(&self.store, &builder).await?;

        // The StatefulSet is only ever created; spec drift is not rolled out.
        let Some(workload) = self
            .store
            .get::<StatefulSet>(namespace, &names.workload())
            .await?
        else {
            self.create_child(&builder.build_statefulset()).await?;
            return Ok(ReconcileOutcome::RequeueAfter(self.config.workload_settle));
        };

        if self
            .store
            .get::<Service>(namespace, &names.headless_service())
            .await?
            .is_none()
        {
            self.create_child(&builder.build_headless_service()).await?;
            return Ok(ReconcileOutcome::RequeueAfter(self.config.service_settle));
        }

        let info = ConnectionInfo::derive(&credential, &names.client_service())?;
        upsert(&self.store, &builder.build_connection_secret(&info)).await?;

        if self
            .store
            .get::<Service>(namespace, &names.client_service())
            .await?
            .is_none()
        {
            self.create_child(&builder.build_client_service()).await?;
            return Ok(ReconcileOutcome::RequeueAfter(self.config.service_settle));
        }

        let mut status = cluster.status.clone().unwrap_or_default();
        status.connection_secret_name = Some(names.connection_secret());

        let readiness = WorkloadReadiness::observe(&workload, cluster.spec.instances);
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let phase = apply_readiness(
            &mut status,
            readiness,
            &names.endpoint(&self.config.cluster_domain),
            cluster.metadata.generation,
            &now,
        );
        self.publish_status(cluster, status).await?;

        match phase {
            ClusterPhase::Ready => {
                info!(name = %names.cluster(), "Postgres cluster is ready");
                Ok(ReconcileOutcome::Converged)
            }
            ClusterPhase::Reconciling => {
                info!(
                    name = %names.cluster(),
                    ready = readiness.ready_replicas,
                    desired = readiness.desired_replicas,
                    "Waiting for StatefulSet to be ready"
                );
                Ok(ReconcileOutcome::RequeueAfter(self.config.readiness_poll))
            }
        }
    }

    async fn create_child<K: StoreObject>(&self, desired: &K) -> Result<()> {
        info!(
            kind = %K::kind(&()),
            name = desired.meta().name.as_deref().unwrap_or_default(),
            "Creating child resource"
        );
        self.store.create(desired).await?;
        Ok(())
    }

    /// Write status only when it differs from what was observed
    async fn publish_status(
        &self,
        cluster: &PostgresCluster,
        status: PostgresClusterStatus,
    ) -> Result<()> {
        if cluster.status.as_ref() == Some(&status) {
            debug!("Status unchanged");
            return Ok(());
        }

        debug!(phase = ?status.phase, "Updating cluster status");
        let mut updated = cluster.clone();
        updated.status = Some(status);
        self.store.update_status(&updated).await?;
        Ok(())
    }
}

/// Reject specs the engine cannot safely act on
fn validate_cluster(cluster: &PostgresCluster) -> Result<()> {
    if let Err(errors) = cluster.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %cluster.name_any(), errors = %error_msg, "Cluster spec validation failed");
        return Err(OperatorError::InvalidConfig(error_msg));
    }

    if cluster.spec.instances == 0 {
        warn!(
            cluster = cluster.name_any(),
            "Cluster scaled to zero instances"
        );
    }

    Ok(())
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Reconciliation engine bound to the API server
    pub reconciler: Reconciler<KubeStore>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub backoff: ErrorBackoff,
}

/// Per-cluster failure counts driving exponential backoff
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    counts: DashMap<String, u32>,
}

impl ErrorBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure for `key`; returns the retry number and its delay
    pub fn record(&self, key: &str, error: &OperatorError) -> (u32, Duration) {
        let retries = {
            let mut entry = self.counts.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        (retries, backoff_delay(error, retries))
    }

    /// Drop the failure history of `key`
    pub fn forget(&self, key: &str) {
        self.counts.remove(key);
    }

    /// Number of clusters with an open failure streak
    pub fn tracked(&self) -> usize {
        self.counts.len()
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("atlasdb_operator_reconciliations_total"),
            errors: metrics::counter!("atlasdb_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("atlasdb_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the PostgresCluster controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
    readiness: Readiness,
) -> Result<()> {
    let clusters: Api<PostgresCluster> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    // Fails fast when the CRD is not installed or RBAC denies access.
    clusters.list(&ListParams::default().limit(1)).await?;

    let ctx = Arc::new(ControllerContext {
        reconciler: Reconciler::new(KubeStore::new(client.clone()), config),
        metrics: Some(ControllerMetrics::new()),
        backoff: ErrorBackoff::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting PostgresCluster controller"
    );

    let statefulsets = match &namespace {
        Some(ns) => Api::<StatefulSet>::namespaced(client.clone(), ns),
        None => Api::<StatefulSet>::all(client.clone()),
    };

    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };

    let secrets = match &namespace {
        Some(ns) => Api::<Secret>::namespaced(client.clone(), ns),
        None => Api::<Secret>::all(client.clone()),
    };

    let owned = || Config::default().labels(MANAGED_BY_SELECTOR);
    let tracker = ctx.clone();

    readiness.mark_ready();

    Controller::new(clusters, Config::default())
        .owns(statefulsets, owned())
        .owns(services, owned())
        .owns(secrets, owned())
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let tracker = tracker.clone();
            async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(
                            name = obj.name,
                            namespace = obj.namespace,
                            ?action,
                            "Reconciliation completed"
                        );
                    }
                    Err(e) => {
                        forget_vanished(&tracker.backoff, &e);
                        error!(error = %e, "Reconciliation failed");
                    }
                }
            }
        })
        .await;

    Ok(())
}

/// Entry point invoked by the kube-runtime controller
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = ?cluster.namespace()))]
async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("PostgresCluster '{}' has no namespace", name))
    })?;

    let result = ctx.reconciler.reconcile(&namespace, &name).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(outcome) => {
            ctx.backoff.forget(&error_key(&namespace, &name));
            Ok(outcome.into_action())
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

fn error_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Backoff for a failed pass: the error's own hint, else 30s doubling up to 600s
fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    })
}

/// A cluster that left the cache takes its failure streak with it
fn forget_vanished<Q: 'static>(backoff: &ErrorBackoff, error: &ControllerError<OperatorError, Q>) {
    if let ControllerError::ObjectNotFound(obj) = error {
        backoff.forget(&error_key(
            obj.namespace.as_deref().unwrap_or_default(),
            &obj.name,
        ));
    }
}

/// Error policy for the controller
fn error_policy(
    cluster: Arc<PostgresCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = error_key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
    let (retries, delay) = ctx.backoff.record(&key, error);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::tests::create_test_cluster;
    use crate::store::MemoryStore;
    use kube::runtime::reflector::ObjectRef;

    #[test]
    fn test_outcome_into_action() {
        assert_eq!(
            ReconcileOutcome::Converged.into_action(),
            Action::await_change()
        );
        assert_eq!(
            ReconcileOutcome::RequeueAfter(Duration::from_secs(5)).into_action(),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_backoff_for_fatal_errors_doubles_and_caps() {
        let fatal = OperatorError::InvalidConfig("bad".to_string());
        assert_eq!(backoff_delay(&fatal, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(&fatal, 2), Duration::from_secs(60));
        assert_eq!(backoff_delay(&fatal, 4), Duration::from_secs(240));
        assert_eq!(backoff_delay(&fatal, 50), Duration::from_secs(600));
    }

    #[test]
    fn test_backoff_uses_error_hint() {
        let transient = OperatorError::StoreError("unavailable".to_string());
        assert_eq!(backoff_delay(&transient, 7), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_streak_grows_and_resets() {
        let backoff = ErrorBackoff::new();
        let fatal = OperatorError::InvalidConfig("bad".to_string());

        assert_eq!(backoff.record("a/pg1", &fatal), (1, Duration::from_secs(30)));
        assert_eq!(backoff.record("a/pg1", &fatal), (2, Duration::from_secs(60)));
        assert_eq!(backoff.record("a/pg2", &fatal), (1, Duration::from_secs(30)));
        assert_eq!(backoff.tracked(), 2);

        backoff.forget("a/pg1");
        assert_eq!(backoff.tracked(), 1);
        assert_eq!(backoff.record("a/pg1", &fatal).0, 1);
    }

    #[test]
    fn test_vanished_cluster_drops_failure_streak() {
        let backoff = ErrorBackoff::new();
        let fatal = OperatorError::InvalidConfig("bad".to_string());
        backoff.record("a/pg1", &fatal);
        backoff.record("a/pg2", &fatal);

        let gone = ObjectRef::<PostgresCluster>::new("pg1").within("a").erase();
        let error = ControllerError::<OperatorError, std::io::Error>::ObjectNotFound(gone);
        forget_vanished(&backoff, &error);

        assert_eq!(backoff.tracked(), 1);
        assert_eq!(backoff.record("a/pg2", &fatal).0, 2);
    }

    #[test]
    fn test_validate_cluster() {
        let cluster = create_test_cluster("pg1", 3);
        assert!(validate_cluster(&cluster).is_ok());

        let mut invalid = cluster;
        invalid.spec.storage_size = "lots".to_string();
        let err = validate_cluster(&invalid).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidConfig(ref msg) if msg.contains("storage_size")));
    }

    #[tokio::test]
    async fn test_missing_cluster_is_converged() {
        let reconciler = Reconciler::new(MemoryStore::new(), OperatorConfig::default());
        let outcome = reconciler.reconcile("a", "ghost").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);
        assert_eq!(reconciler.store().write_count(), 0);
    }
}

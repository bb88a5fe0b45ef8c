//! Phase and condition bookkeeping for `PostgresCluster` status.
//!
//! Status is a level-triggered reflection of the StatefulSet: the cluster is
//! `Ready` while every declared replica is ready and drops back to
//! `Reconciling` as soon as one is not.

use crate::crd::{ClusterCondition, ClusterPhase, ConditionStatus, PostgresClusterStatus};
use k8s_openapi::api::apps::v1::StatefulSet;

/// Condition type reporting overall readiness
pub const CONDITION_READY: &str = "Ready";

/// Reason while replicas are still coming up
pub const REASON_RECONCILING: &str = "Reconciling";

/// Reason once every replica is ready
pub const REASON_CLUSTER_READY: &str = "ClusterReady";

/// Insert or replace a condition by type.
///
/// `last_transition_time` only moves when `status` changes. Returns whether
/// anything in the list changed.
pub fn set_condition(conditions: &mut Vec<ClusterCondition>, new: ClusterCondition) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        Some(existing) => {
            let mut merged = new;
            if existing.status == merged.status {
                merged.last_transition_time = existing.last_transition_time.clone();
            }
            let changed = *existing != merged;
            *existing = merged;
            changed
        }
        None => {
            conditions.push(new);
            true
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(
    conditions: &'a [ClusterCondition],
    condition_type: &str,
) -> Option<&'a ClusterCondition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Observed replica readiness of the StatefulSet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadReadiness {
    pub ready_replicas: i32,
    pub desired_replicas: i32,
}

impl WorkloadReadiness {
    /// Read readiness off a StatefulSet; `fallback_desired` covers a missing replica count
    pub fn observe(sts: &StatefulSet, fallback_desired: i32) -> Self {
        let desired_replicas = sts
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(fallback_desired);
        let ready_replicas = sts
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        Self {
            ready_replicas,
            desired_replicas,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_replicas == self.desired_replicas
    }
}

/// Move `status` to the phase implied by `readiness`.
///
/// `endpoint` is published only when ready; a regression keeps the last
/// published endpoint.
pub fn apply_readiness(
    status: &mut PostgresClusterStatus,
    readiness: WorkloadReadiness,
    endpoint: &str,
    generation: Option<i64>,
    now: &str,
) -> ClusterPhase {
    let (phase, condition_status, reason, message) = if readiness.is_ready() {
        (
            ClusterPhase::Ready,
            ConditionStatus::True,
            REASON_CLUSTER_READY,
            "Postgres cluster is ready".to_string(),
        )
    } else {
        (
            ClusterPhase::Reconciling,
            ConditionStatus::False,
            REASON_RECONCILING,
            format!(
                "Waiting for pods to become ready ({}/{})",
                readiness.ready_replicas, readiness.desired_replicas
            ),
        )
    };

    set_condition(
        &mut status.conditions,
        ClusterCondition {
            condition_type: CONDITION_READY.to_string(),
            status: condition_status,
            reason: reason.to_string(),
            message,
            last_transition_time: now.to_string(),
            observed_generation: generation,
        },
    );

    status.phase = phase;
    status.observed_generation = generation;
    if phase == ClusterPhase::Ready {
        status.endpoint = Some(endpoint.to_string());
    }
    phase
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};

    const T0: &str = "2026-01-01T00:00:00Z";
    const T1: &str = "2026-01-01T00:05:00Z";
    const ENDPOINT: &str = "pg1-rw.a.svc.cluster.local:5432";

    fn ready_condition(status: ConditionStatus, now: &str) -> ClusterCondition {
        ClusterCondition {
            condition_type: CONDITION_READY.to_string(),
            status,
            reason: REASON_RECONCILING.to_string(),
            message: "Waiting".to_string(),
            last_transition_time: now.to_string(),
            observed_generation: None,
        }
    }

    fn sts(desired: i32, ready: Option<i32>) -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                replicas: desired,
                ready_replicas: ready,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_identical_upsert_keeps_transition_time() {
        let mut conditions = vec![];
        assert!(set_condition(
            &mut conditions,
            ready_condition(ConditionStatus::False, T0)
        ));
        assert!(!set_condition(
            &mut conditions,
            ready_condition(ConditionStatus::False, T1)
        ));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, T0);
    }

    #[test]
    fn test_status_change_moves_transition_time() {
        let mut conditions = vec![ready_condition(ConditionStatus::False, T0)];
        assert!(set_condition(
            &mut conditions,
            ready_condition(ConditionStatus::True, T1)
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].last_transition_time, T1);
    }

    #[test]
    fn test_reason_change_without_status_change() {
        let mut conditions = vec![ready_condition(ConditionStatus::False, T0)];
        let mut changed = ready_condition(ConditionStatus::False, T1);
        changed.message = "Still waiting".to_string();

        assert!(set_condition(&mut conditions, changed));
        assert_eq!(conditions[0].message, "Still waiting");
        assert_eq!(conditions[0].last_transition_time, T0);
    }

    #[test]
    fn test_distinct_types_are_appended_in_order() {
        let mut conditions = vec![ready_condition(ConditionStatus::False, T0)];
        let mut other = ready_condition(ConditionStatus::True, T0);
        other.condition_type = "CredentialsReady".to_string();
        set_condition(&mut conditions, other);

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].condition_type, "CredentialsReady");
        assert!(find_condition(&conditions, "CredentialsReady").is_some());
        assert!(find_condition(&conditions, "Missing").is_none());
    }

    #[test]
    fn test_observe_defaults_missing_ready_count_to_zero() {
        let readiness = WorkloadReadiness::observe(&sts(3, None), 1);
        assert_eq!(readiness.ready_replicas, 0);
        assert_eq!(readiness.desired_replicas, 3);

        let readiness = WorkloadReadiness::observe(&StatefulSet::default(), 2);
        assert_eq!(readiness.desired_replicas, 2);
    }

    #[test]
    fn test_partial_readiness_is_reconciling() {
        let mut status = PostgresClusterStatus::default();
        let readiness = WorkloadReadiness::observe(&sts(3, Some(2)), 3);

        let phase = apply_readiness(&mut status, readiness, ENDPOINT, Some(1), T0);

        assert_eq!(phase, ClusterPhase::Reconciling);
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_RECONCILING);
        assert_eq!(status.endpoint, None);
    }

    #[test]
    fn test_full_readiness_publishes_endpoint() {
        let mut status = PostgresClusterStatus::default();
        apply_readiness(
            &mut status,
            WorkloadReadiness::observe(&sts(3, Some(2)), 3),
            ENDPOINT,
            Some(1),
            T0,
        );
        let phase = apply_readiness(
            &mut status,
            WorkloadReadiness::observe(&sts(3, Some(3)), 3),
            ENDPOINT,
            Some(1),
            T1,
        );

        assert_eq!(phase, ClusterPhase::Ready);
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(status.endpoint.as_deref(), Some(ENDPOINT));
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, REASON_CLUSTER_READY);
        assert_eq!(ready.last_transition_time, T1);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_regression_returns_to_reconciling() {
        let mut status = PostgresClusterStatus::default();
        apply_readiness(
            &mut status,
            WorkloadReadiness::observe(&sts(3, Some(3)), 3),
            ENDPOINT,
            Some(1),
            T0,
        );
        let phase = apply_readiness(
            &mut status,
            WorkloadReadiness::observe(&sts(3, Some(1)), 3),
            ENDPOINT,
            Some(1),
            T1,
        );

        assert_eq!(phase, ClusterPhase::Reconciling);
        assert_eq!(status.endpoint.as_deref(), Some(ENDPOINT));
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.last_transition_time, T1);
    }
}

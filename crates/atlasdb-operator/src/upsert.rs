//! Idempotent create-or-replace of controller-owned fields.
//!
//! `upsert` fetches the object by its deterministic name, creates it when
//! missing, and otherwise copies only the fields the operator owns onto the
//! stored copy. Server-managed metadata (uid, resourceVersion, timestamps)
//! comes from the stored copy untouched. When nothing owned has changed no
//! write is issued, so a second call with the same desired object is free.

use crate::error::Result;
use crate::store::{object_ref, ObjectStore, StoreObject};
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info};

/// Fields of a kind the operator is authoritative for
pub trait OwnedFields {
    /// Overwrite the owned fields of `self` with those of `desired`
    fn apply_owned_fields(&mut self, desired: &Self);
}

impl OwnedFields for Secret {
    fn apply_owned_fields(&mut self, desired: &Self) {
        self.data = desired.data.clone();
        self.string_data = desired.string_data.clone();
        self.metadata.labels = desired.metadata.labels.clone();
        self.metadata.annotations = desired.metadata.annotations.clone();
    }
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Create `desired`, or bring the stored object's owned fields in line with it
pub async fn upsert<S, K>(store: &S, desired: &K) -> Result<UpsertOutcome>
where
    S: ObjectStore,
    K: StoreObject + OwnedFields + PartialEq,
{
    let (namespace, name) = object_ref(desired)?;
    let kind = K::kind(&());

    let Some(existing) = store.get::<K>(&namespace, &name).await? else {
        info!(kind = %kind, name = %name, namespace = %namespace, "Creating object");
        store.create(desired).await?;
        return Ok(UpsertOutcome::Created);
    };

    let mut merged = existing.clone();
    merged.apply_owned_fields(desired);
    if merged == existing {
        debug!(kind = %kind, name = %name, "Object already up to date");
        return Ok(UpsertOutcome::Unchanged);
    }

    info!(kind = %kind, name = %name, namespace = %namespace, "Updating object");
    store.update(&merged).await?;
    Ok(UpsertOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(value: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("uri".to_string(), ByteString(value.as_bytes().to_vec()));
        Secret {
            metadata: ObjectMeta {
                name: Some("pg1-connection".to_string()),
                namespace: Some("a".to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_creates_when_absent() {
        let store = MemoryStore::new();
        let outcome = upsert(&store, &secret("one")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);
        assert!(store.contains::<Secret>("a", "pg1-connection"));
    }

    #[tokio::test]
    async fn test_second_identical_upsert_writes_nothing() {
        let store = MemoryStore::new();
        upsert(&store, &secret("one")).await.unwrap();
        store.clear_journal();

        let outcome = upsert(&store, &secret("one")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_replaces_owned_fields_only() {
        let store = MemoryStore::new();
        upsert(&store, &secret("one")).await.unwrap();
        let before: Secret = store.get("a", "pg1-connection").await.unwrap().unwrap();

        let outcome = upsert(&store, &secret("two")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let after: Secret = store.get("a", "pg1-connection").await.unwrap().unwrap();
        assert_eq!(after.metadata.uid, before.metadata.uid);
        assert_eq!(
            after.metadata.creation_timestamp,
            before.metadata.creation_timestamp
        );
        assert_eq!(
            after.data.unwrap()["uri"],
            ByteString(b"two".to_vec())
        );
        assert_eq!(store.journal().last().unwrap().op, StoreOp::Update);
    }
}

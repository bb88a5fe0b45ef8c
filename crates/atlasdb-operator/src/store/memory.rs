use super::{object_ref, ObjectStore, StoreObject};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Store operation, used by the write journal and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// One successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: StoreOp,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Failure to return from the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Transient unavailability
    Unavailable,
    /// Optimistic-concurrency conflict
    Conflict,
    /// Another writer created the object first
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: String,
    namespace: String,
    name: String,
}

struct Fault {
    op: StoreOp,
    kind: String,
    failure: InjectedFailure,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    version: u64,
    uids: u64,
    journal: Vec<WriteRecord>,
    faults: Vec<Fault>,
}

/// In-process object store with Kubernetes-like semantics
///
/// Emulates what the engine relies on from the API server: server-assigned
/// uid/resourceVersion/creationTimestamp, optimistic conflicts on stale writes,
/// the status sub-resource being written separately from the rest of the
/// object, finalizer-gated deletion and owner-reference cascade.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn key_of<K: StoreObject>(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey {
        kind: K::kind(&()).to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn resource_version(value: &Value) -> Option<&str> {
    value
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
}

fn has_finalizers(value: &Value) -> bool {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    value
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|ts| !ts.is_null())
}

fn owned_by(value: &Value, uid: &str) -> bool {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid))
        })
}

/// Carry a server-managed field over from the stored object
fn preserve(target: &mut Value, stored: &Value, pointer: &str) {
    let (parent, field) = match pointer.rsplit_once('/') {
        Some(split) => split,
        None => return,
    };
    let kept = stored.pointer(pointer).cloned();
    let slot = if parent.is_empty() {
        Some(target)
    } else {
        target.pointer_mut(parent)
    };
    if let Some(Value::Object(map)) = slot {
        match kept {
            Some(v) => {
                map.insert(field.to_string(), v);
            }
            None => {
                map.remove(field);
            }
        }
    }
}

impl Inner {
    fn take_fault(&mut self, op: StoreOp, key: &ObjectKey) -> Result<()> {
        let position = self
            .faults
            .iter()
            .position(|f| f.op == op && f.kind == key.kind);
        let Some(position) = position else {
            return Ok(());
        };
        let fault = self.faults.remove(position);
        Err(match fault.failure {
            InjectedFailure::Unavailable => OperatorError::StoreError(format!(
                "injected {:?} failure for {}/{} in namespace {}",
                op, key.kind, key.name, key.namespace
            )),
            InjectedFailure::Conflict => OperatorError::Conflict {
                kind: key.kind.clone(),
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                message: "injected conflict".to_string(),
            },
            InjectedFailure::AlreadyExists => OperatorError::AlreadyExists {
                kind: key.kind.clone(),
                name: key.name.clone(),
                namespace: key.namespace.clone(),
            },
        })
    }

    fn bump(&mut self, value: &mut Value) {
        self.version += 1;
        value["metadata"]["resourceVersion"] = Value::String(self.version.to_string());
    }

    fn record(&mut self, op: StoreOp, key: &ObjectKey) {
        self.journal.push(WriteRecord {
            op,
            kind: key.kind.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        });
    }

    fn check_version(key: &ObjectKey, stored: &Value, incoming: Option<&str>) -> Result<()> {
        match incoming {
            Some(rv) if Some(rv) != resource_version(stored) => Err(OperatorError::Conflict {
                kind: key.kind.clone(),
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                message: format!(
                    "resourceVersion {} is stale (current {})",
                    rv,
                    resource_version(stored).unwrap_or("<none>")
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Remove an object and, transitively, everything it controls
    fn remove_cascading(&mut self, key: &ObjectKey) {
        let Some(removed) = self.objects.remove(key) else {
            return;
        };
        let Some(uid) = removed
            .pointer("/metadata/uid")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return;
        };
        let dependents: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|(k, v)| k.namespace == key.namespace && owned_by(v, &uid))
            .map(|(k, _)| k.clone())
            .collect();
        for dependent in dependents {
            self.remove_cascading(&dependent);
        }
    }

    fn not_found(key: &ObjectKey) -> OperatorError {
        OperatorError::NotFound {
            kind: key.kind.clone(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `op` on objects of kind `K`
    pub fn inject_failure<K: StoreObject>(&self, op: StoreOp, failure: InjectedFailure) {
        self.lock().faults.push(Fault {
            op,
            kind: K::kind(&()).to_string(),
            failure,
        });
    }

    /// All successful writes so far, oldest first
    pub fn journal(&self) -> Vec<WriteRecord> {
        self.lock().journal.clone()
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.lock().journal.len()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Whether an object of kind `K` exists
    pub fn contains<K: StoreObject>(&self, namespace: &str, name: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&key_of::<K>(namespace, name))
    }

    /// Total number of stored objects
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored object as its wire document, ordered by kind, namespace and name
    pub fn documents(&self) -> Vec<Value> {
        self.lock().objects.values().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let mut inner = self.lock();
        let key = key_of::<K>(namespace, name);
        inner.take_fault(StoreOp::Get, &key)?;
        inner
            .objects
            .get(&key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(OperatorError::from)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_ref(obj)?;
        let key = key_of::<K>(&namespace, &name);
        let mut inner = self.lock();
        inner.take_fault(StoreOp::Create, &key)?;
        if inner.objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind: key.kind,
                name,
                namespace,
            });
        }

        let mut value = serde_json::to_value(obj)?;
        inner.uids += 1;
        let uid = format!("uid-{:08}", inner.uids);
        let meta = &mut value["metadata"];
        meta["uid"] = Value::String(uid);
        meta["creationTimestamp"] = Value::String(now());
        meta["generation"] = Value::from(1);
        if let Value::Object(map) = meta {
            map.remove("deletionTimestamp");
        }
        inner.bump(&mut value);

        inner.objects.insert(key.clone(), value.clone());
        inner.record(StoreOp::Create, &key);
        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_ref(obj)?;
        let key = key_of::<K>(&namespace, &name);
        let mut inner = self.lock();
        inner.take_fault(StoreOp::Update, &key)?;
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Inner::not_found(&key))?;
        Inner::check_version(&key, &stored, obj.meta().resource_version.as_deref())?;

        let mut value = serde_json::to_value(obj)?;
        for pointer in [
            "/metadata/uid",
            "/metadata/creationTimestamp",
            "/metadata/deletionTimestamp",
            "/metadata/generation",
            "/status",
        ] {
            preserve(&mut value, &stored, pointer);
        }
        if value.get("spec") != stored.get("spec") {
            let generation = stored
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            value["metadata"]["generation"] = Value::from(generation + 1);
        }
        inner.bump(&mut value);

        if is_deleting(&value) && !has_finalizers(&value) {
            inner.remove_cascading(&key);
        } else {
            inner.objects.insert(key.clone(), value.clone());
        }
        inner.record(StoreOp::Update, &key);
        Ok(serde_json::from_value(value)?)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_ref(obj)?;
        let key = key_of::<K>(&namespace, &name);
        let mut inner = self.lock();
        inner.take_fault(StoreOp::UpdateStatus, &key)?;
        let mut stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Inner::not_found(&key))?;
        Inner::check_version(&key, &stored, obj.meta().resource_version.as_deref())?;

        let incoming = serde_json::to_value(obj)?;
        preserve(&mut stored, &incoming, "/status");
        inner.bump(&mut stored);

        inner.objects.insert(key.clone(), stored.clone());
        inner.record(StoreOp::UpdateStatus, &key);
        Ok(serde_json::from_value(stored)?)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = key_of::<K>(namespace, name);
        let mut inner = self.lock();
        inner.take_fault(StoreOp::Delete, &key)?;
        let Some(mut stored) = inner.objects.get(&key).cloned() else {
            return Ok(());
        };

        if has_finalizers(&stored) {
            if !is_deleting(&stored) {
                stored["metadata"]["deletionTimestamp"] = Value::String(now());
                inner.bump(&mut stored);
                inner.objects.insert(key.clone(), stored);
            }
        } else {
            inner.remove_cascading(&key);
        }
        inner.record(StoreOp::Delete, &key);
        Ok(())
    }
}

//! Object store adapter
//!
//! Every component reads and writes cluster state through [`ObjectStore`]. The
//! store is the only shared mutable resource: writes are optimistic and a stale
//! write fails with [`OperatorError::Conflict`] instead of being merged locally.
//!
//! [`KubeStore`] talks to the Kubernetes API server; [`MemoryStore`] keeps
//! everything in process and is what the engine tests run against.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::{InjectedFailure, MemoryStore, StoreOp, WriteRecord};

use crate::error::OperatorError;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Namespaced Kubernetes object the store can persist
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// get/create/update/delete over the cluster's object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Create an object; fails with `AlreadyExists` when racing another writer
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object's spec and metadata; fails with `Conflict` on a stale version
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace only the status sub-resource
    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Request deletion; objects with finalizers are only marked
    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Namespace and name of an object about to be written
pub(crate) fn object_ref<K: StoreObject>(obj: &K) -> Result<(String, String)> {
    let meta = obj.meta();
    let name = meta.name.clone().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} missing metadata.name", K::kind(&())))
    })?;
    let namespace = meta.namespace.clone().ok_or_else(|| {
        OperatorError::InvalidConfig(format!(
            "{} {} missing metadata.namespace",
            K::kind(&()),
            name
        ))
    })?;
    Ok((namespace, name))
}

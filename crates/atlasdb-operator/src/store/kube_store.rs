use super::{object_ref, ObjectStore, StoreObject};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

/// Object store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate 409s into the store's conflict taxonomy
fn classify<K: StoreObject>(
    err: kube::Error,
    namespace: &str,
    name: &str,
    on_create: bool,
) -> OperatorError {
    match err {
        kube::Error::Api(response) if response.code == 409 => {
            let kind = K::kind(&()).to_string();
            if on_create {
                OperatorError::AlreadyExists {
                    kind,
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }
            } else {
                OperatorError::Conflict {
                    kind,
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    message: response.message,
                }
            }
        }
        kube::Error::Api(response) if response.code == 404 => OperatorError::NotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        other => OperatorError::KubeError(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(OperatorError::from)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_ref(obj)?;
        debug!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Creating object");
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, &namespace, &name, true))
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_ref(obj)?;
        debug!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Replacing object");
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, &namespace, &name, false))
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_ref(obj)?;
        debug!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Replacing status");
        let value = serde_json::to_value(obj)?;
        // resourceVersion in a merge patch acts as an optimistic-concurrency precondition
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        self.api::<K>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify::<K>(e, &namespace, &name, false))
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(classify::<K>(e, namespace, name, false)),
        }
    }
}

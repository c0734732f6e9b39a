//! Access to the orchestration api.
//!
//! Everything the engine does against the cluster goes through [`ObjectStore`].
//! Production code uses [`KubeStore`]; a reconcile pass wraps it in a
//! [`PassStore`] so that every call observes the pass deadline.

use crate::errors::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use tokio::time::Instant;

#[cfg(test)]
pub mod memory;

/// Namespaced object kinds the engine reads and writes.
pub trait Object:
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

impl<K> Object for K where
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

/// `namespace/name`, the identity children are matched by.
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default()
    )
}

pub fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).into_owned()
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>>;

    async fn namespaces(&self) -> Result<Vec<Namespace>>;

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Deleting an object that is already gone is not an error.
    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()>;

    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;

    /// Point in time after which calls fail with `DeadlineExceeded`.
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>> {
        let list = self.api::<K>(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        Ok(self
            .api::<K>(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Store handle for a single reconcile pass: every call is cut off at the
/// pass deadline.
pub struct PassStore<'a, S> {
    inner: &'a S,
    deadline: Instant,
}

impl<'a, S: ObjectStore> PassStore<'a, S> {
    pub fn new(inner: &'a S, deadline: Instant) -> Self {
        PassStore { inner, deadline }
    }
}

async fn bounded<T, F>(deadline: Instant, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if Instant::now() >= deadline {
        bail!(ErrorKind::DeadlineExceeded);
    }
    match tokio::time::timeout_at(deadline, call).await {
        Ok(res) => res,
        Err(_) => bail!(ErrorKind::DeadlineExceeded),
    }
}

#[async_trait]
impl<'a, S: ObjectStore> ObjectStore for PassStore<'a, S> {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        bounded(self.deadline, self.inner.get::<K>(namespace, name)).await
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>> {
        bounded(self.deadline, self.inner.list::<K>(namespace)).await
    }

    async fn namespaces(&self) -> Result<Vec<Namespace>> {
        bounded(self.deadline, self.inner.namespaces()).await
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        bounded(self.deadline, self.inner.create(namespace, obj)).await
    }

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        bounded(self.deadline, self.inner.replace(namespace, obj)).await
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        bounded(self.deadline, self.inner.delete::<K>(namespace, name)).await
    }

    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        bounded(
            self.deadline,
            self.inner.patch_status::<K>(namespace, name, status),
        )
        .await
    }

    fn deadline(&self) -> Option<Instant> {
        Some(self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::time::Duration;

    #[tokio::test]
    async fn pass_store_fails_after_deadline() {
        let mem = MemoryStore::new();
        let pass = PassStore::new(&mem, Instant::now() - Duration::from_millis(1));
        let err = pass.get::<ConfigMap>("default", "x").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DeadlineExceeded));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn pass_store_forwards_before_deadline() {
        let mem = MemoryStore::new();
        let pass = PassStore::new(&mem, Instant::now() + Duration::from_secs(10));
        assert!(pass.get::<ConfigMap>("default", "x").await.unwrap().is_none());
        assert_eq!(mem.calls("get", "ConfigMap"), 1);
    }
}

//! Typed access to the Resource Store
//!
//! [`TypedStore`] pairs a store with the registry so callers work with CRD
//! structs. `patch` and `patch_status` implement read-modify-write with a
//! version check, retrying on conflict by re-reading and reapplying the
//! mutation.

use super::{ListSelector, ObjectKey, Registry, ResourceStoreRef, StoreObject};
use crate::error::Result;
use backoff::ExponentialBackoffBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Typed view over a [`ResourceStore`](super::ResourceStore)
#[derive(Clone)]
pub struct TypedStore {
    store: ResourceStoreRef,
    registry: Arc<Registry>,
}

impl TypedStore {
    pub fn new(store: ResourceStoreRef, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// Underlying dynamic store
    pub fn store(&self) -> &ResourceStoreRef {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Key of a typed object in the given namespace
    pub fn key<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<ObjectKey> {
        let kind = K::kind(&()).to_string();
        let namespace = if self.registry.get(&kind)?.is_namespaced() {
            namespace.map(String::from)
        } else {
            None
        };
        Ok(ObjectKey {
            kind,
            namespace,
            name: name.to_string(),
        })
    }

    pub async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let key = self.key::<K>(namespace, name)?;
        let obj = self.store.get(&key).await?;
        self.registry.decode(&obj)
    }

    /// Get, mapping not-found to `None`
    pub async fn get_opt<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<K>> {
        let kind = K::kind(&());
        self.store
            .list(&kind, namespace, selector)
            .await?
            .iter()
            .map(|o| self.registry.decode(o))
            .collect()
    }

    pub async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let created = self.store.create(self.registry.encode(obj)?).await?;
        self.registry.decode(&created)
    }

    pub async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let updated = self.store.update(self.registry.encode(obj)?).await?;
        self.registry.decode(&updated)
    }

    pub async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let updated = self.store.update_status(self.registry.encode(obj)?).await?;
        self.registry.decode(&updated)
    }

    pub async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = self.key::<K>(namespace, name)?;
        self.store.delete(&key).await
    }

    /// Read-modify-write of spec/metadata. `mutate` returns whether it changed
    /// anything; an unchanged object is returned without a write.
    pub async fn patch<K, F>(&self, namespace: Option<&str>, name: &str, mutate: F) -> Result<K>
    where
        K: StoreObject,
        F: Fn(&mut K) -> bool + Send + Sync,
    {
        self.read_modify_write(namespace, name, mutate, false).await
    }

    /// Read-modify-write of the status
    pub async fn patch_status<K, F>(&self, namespace: Option<&str>, name: &str, mutate: F) -> Result<K>
    where
        K: StoreObject,
        F: Fn(&mut K) -> bool + Send + Sync,
    {
        self.read_modify_write(namespace, name, mutate, true).await
    }

    async fn read_modify_write<K, F>(
        &self,
        namespace: Option<&str>,
        name: &str,
        mutate: F,
        status: bool,
    ) -> Result<K>
    where
        K: StoreObject,
        F: Fn(&mut K) -> bool + Send + Sync,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_secs(1))
            .with_max_elapsed_time(Some(Duration::from_secs(10)))
            .build();
        let mutate = &mutate;

        backoff::future::retry(policy, || async move {
            let mut obj: K = self.get(namespace, name).await.map_err(backoff::Error::permanent)?;
            if !mutate(&mut obj) {
                return Ok(obj);
            }
            let written = if status {
                self.update_status(&obj).await
            } else {
                self.update(&obj).await
            };
            written.map_err(|e| {
                if e.is_conflict() {
                    debug!(name, "Conflict on write, re-reading");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }
}

impl std::fmt::Debug for TypedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStore")
            .field("kinds", &self.registry.kinds().collect::<Vec<_>>())
            .finish()
    }
}

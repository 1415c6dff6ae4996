//! Class sources
//!
//! The broker resolves against `ResourceClass` objects in its backend store;
//! the poollet resolves against the classes its runtime lists.

use crate::crd::{ResourceClass, ResourceKind};
use crate::domain::ports::{ClassInfo, ClassSource, RuntimeRef};
use crate::error::Result;
use crate::store::{ListSelector, TypedStore};
use async_trait::async_trait;

/// Classes defined as `ResourceClass` objects of one kind
pub struct StoreClassSource {
    store: TypedStore,
    kind: ResourceKind,
}

impl StoreClassSource {
    pub fn new(store: TypedStore, kind: ResourceKind) -> Self {
        Self { store, kind }
    }
}

#[async_trait]
impl ClassSource for StoreClassSource {
    async fn list_classes(&self) -> Result<Vec<ClassInfo>> {
        let classes: Vec<ResourceClass> = self.store.list(None, &ListSelector::all()).await?;
        Ok(classes
            .into_iter()
            .filter(|c| c.spec.kind == self.kind && c.metadata.deletion_timestamp.is_none())
            .map(|c| ClassInfo::new(c.name(), c.spec.capabilities.clone()))
            .collect())
    }
}

/// Classes a runtime lists, including those no pool has capacity for
pub struct RuntimeClassSource {
    runtime: RuntimeRef,
}

impl RuntimeClassSource {
    pub fn new(runtime: RuntimeRef) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ClassSource for RuntimeClassSource {
    async fn list_classes(&self) -> Result<Vec<ClassInfo>> {
        self.runtime.list_classes().await
    }
}

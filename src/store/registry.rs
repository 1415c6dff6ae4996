//! Explicit type registry
//!
//! Maps kind names to their API resource and scope, and converts between
//! typed objects and [`DynamicObject`]s. Built once at startup and passed to
//! every component that (de)serializes typed objects.

use crate::crd::{Bucket, ResourceClass, ResourcePool, Volume, Workload};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Anything that can be stored through the registry
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<T> StoreObject for T where
    T: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Whether a kind lives in a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// A registered kind
#[derive(Debug, Clone)]
pub struct RegisteredKind {
    pub resource: ApiResource,
    pub scope: Scope,
}

impl RegisteredKind {
    pub fn is_namespaced(&self) -> bool {
        self.scope == Scope::Namespaced
    }
}

/// Kind name to API resource
#[derive(Debug, Clone, Default)]
pub struct Registry {
    kinds: BTreeMap<String, RegisteredKind>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every kind this crate stores
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register::<ResourceClass>(Scope::Cluster)
            .register::<ResourcePool>(Scope::Cluster)
            .register::<Volume>(Scope::Namespaced)
            .register::<Bucket>(Scope::Namespaced)
            .register::<Workload>(Scope::Namespaced)
            .register::<Secret>(Scope::Namespaced);
        registry
    }

    /// Register a typed kind
    pub fn register<K: StoreObject>(&mut self, scope: Scope) -> &mut Self {
        let resource = ApiResource::erase::<K>(&());
        self.kinds
            .insert(resource.kind.clone(), RegisteredKind { resource, scope });
        self
    }

    /// Look up a kind by name
    pub fn get(&self, kind: &str) -> Result<&RegisteredKind> {
        self.kinds
            .get(kind)
            .ok_or_else(|| Error::UnregisteredKind(kind.to_string()))
    }

    /// Names of all registered kinds
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Convert a typed object into its dynamic form
    pub fn encode<K: StoreObject>(&self, obj: &K) -> Result<DynamicObject> {
        let registered = self.get(&K::kind(&()))?;
        let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        if dynamic.types.is_none() {
            dynamic.types = Some(type_meta(&registered.resource));
        }
        Ok(dynamic)
    }

    /// Convert a dynamic object into its typed form
    pub fn decode<K: StoreObject>(&self, obj: &DynamicObject) -> Result<K> {
        let kind = K::kind(&());
        self.get(&kind)?;
        if let Some(types) = &obj.types {
            if types.kind != kind {
                return Err(Error::Internal(format!(
                    "cannot decode {} as {}",
                    types.kind, kind
                )));
            }
        }
        Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
    }
}

/// Type meta for an API resource
pub fn type_meta(resource: &ApiResource) -> TypeMeta {
    TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PoolResource, PoolResourceSpec};
    use assert_matches::assert_matches;

    #[test]
    fn test_default_kinds() {
        let registry = Registry::with_defaults();
        let kinds: Vec<&str> = registry.kinds().collect();
        assert_eq!(
            kinds,
            vec!["Bucket", "ResourceClass", "ResourcePool", "Secret", "Volume", "Workload"]
        );
        assert!(registry.get("Volume").unwrap().is_namespaced());
        assert!(!registry.get("ResourcePool").unwrap().is_namespaced());
        assert_eq!(registry.get("Secret").unwrap().resource.api_version, "v1");
    }

    #[test]
    fn test_encode_decode() {
        let registry = Registry::with_defaults();
        let vol = Volume::build(
            "vol-1",
            PoolResourceSpec {
                class_ref: "fast".into(),
                ..Default::default()
            },
        );
        let dynamic = registry.encode(&vol).unwrap();
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "Volume");
        assert_eq!(dynamic.data["spec"]["classRef"], "fast");

        let back: Volume = registry.decode(&dynamic).unwrap();
        assert_eq!(back.common().class_ref, "fast");

        assert_matches!(registry.decode::<Bucket>(&dynamic), Err(Error::Internal(_)));
    }

    #[test]
    fn test_unregistered_kind() {
        let registry = Registry::new();
        let vol = Volume::build("vol-1", PoolResourceSpec::default());
        assert_matches!(registry.encode(&vol), Err(Error::UnregisteredKind(k)) if k == "Volume");
    }
}

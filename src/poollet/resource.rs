use super::{PoolletConfig, FINALIZER, NAMESPACE_LABEL, NAME_LABEL, UID_LABEL};
use crate::broker::aggregate::secret_payload;
use crate::classes::ClassMapper;
use crate::crd::{PoolResource, ResourceClass, ResourceList, ResourcePhase};
use crate::domain::ports::{
    AccessInfo, EventSeverity, ListFilter, RuntimeMetadata, RuntimeObject, RuntimeRef, RuntimeSpec, RuntimeState,
};
use crate::error::{Error, Result};
use crate::reconcile::{Action, Reconciler};
use crate::store::{emit_event, EventSinkRef, ObjectKey, TypedStore, WatchEvent};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Drives requests placed on this pool through the runtime.
///
/// Creates the runtime object (guarded by a finalizer), propagates resource
/// changes, mirrors runtime state into the request status and deletes the
/// runtime object when the request goes away.
pub struct ResourceReconciler<K: PoolResource> {
    name: String,
    kind: String,
    pool_name: String,
    namespace: Option<String>,
    resync: Duration,
    store: TypedStore,
    events: EventSinkRef,
    runtime: RuntimeRef,
    classes: Arc<ClassMapper>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: PoolResource> ResourceReconciler<K> {
    pub fn new(
        config: &PoolletConfig,
        store: TypedStore,
        events: EventSinkRef,
        runtime: RuntimeRef,
        classes: Arc<ClassMapper>,
    ) -> Self {
        Self {
            name: format!("{}-poollet", K::RESOURCE_KIND),
            kind: K::kind(&()).to_string(),
            pool_name: config.pool_name.clone(),
            namespace: config.namespace.clone(),
            resync: config.resync_interval,
            store,
            events,
            runtime,
            classes,
            _kind: PhantomData,
        }
    }

    fn is_ours(&self, obj: &K) -> bool {
        obj.common().pool_ref.as_deref() == Some(self.pool_name.as_str())
    }

    fn owner_filter(uid: &str) -> ListFilter {
        ListFilter::by_labels(BTreeMap::from([(UID_LABEL.to_string(), uid.to_string())]))
    }

    async fn ensure_finalizer(&self, key: &ObjectKey) -> Result<()> {
        let _: K = self
            .store
            .patch(key.namespace.as_deref(), &key.name, |obj: &mut K| {
                let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
                if finalizers.iter().any(|f| f == FINALIZER) {
                    return false;
                }
                finalizers.push(FINALIZER.to_string());
                true
            })
            .await?;
        Ok(())
    }

    /// Delete the runtime object, then release the request
    async fn finalize(&self, obj: &K, key: &ObjectKey) -> Result<Action> {
        let has_finalizer = obj
            .meta()
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|f| f == FINALIZER))
            .unwrap_or(false);
        if !has_finalizer {
            return Ok(Action::Done);
        }

        if let Some(uid) = &obj.meta().uid {
            for existing in self.runtime.list(&Self::owner_filter(uid)).await? {
                match self.runtime.delete(&existing.metadata.id).await {
                    Ok(()) => info!(id = %existing.metadata.id, "Deleted runtime object"),
                    Err(e) if e.is_not_found() => debug!(id = %existing.metadata.id, "Runtime object already gone"),
                    Err(e) => return Err(e),
                }
            }
        }

        let _: K = self
            .store
            .patch(key.namespace.as_deref(), &key.name, |obj: &mut K| {
                let Some(finalizers) = obj.meta_mut().finalizers.as_mut() else {
                    return false;
                };
                let before = finalizers.len();
                finalizers.retain(|f| f != FINALIZER);
                finalizers.len() != before
            })
            .await?;
        debug!("Released finalizer");
        Ok(Action::Done)
    }

    async fn create_runtime_object(&self, obj: &K, uid: &str) -> Result<RuntimeObject> {
        let common = obj.common();
        let class = self
            .store
            .get_opt::<ResourceClass>(None, &common.class_ref)
            .await?
            .ok_or_else(|| Error::NoMatchingClass {
                kind: K::RESOURCE_KIND.to_string(),
                name: common.class_ref.clone(),
                signature: "(undefined)".to_string(),
            })?;
        let resolved = self.classes.resolve(class.name(), &class.spec.capabilities)?;

        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let secret_data = match &common.secret_ref {
            Some(name) => {
                let secret: Secret = self.store.get(Some(&namespace), name).await?;
                Some(secret_payload(&secret).secret_data)
            }
            None => None,
        };

        let request = RuntimeObject {
            metadata: RuntimeMetadata {
                labels: BTreeMap::from([
                    (NAMESPACE_LABEL.to_string(), namespace),
                    (NAME_LABEL.to_string(), obj.object_name().to_string()),
                    (UID_LABEL.to_string(), uid.to_string()),
                ]),
                ..Default::default()
            },
            spec: RuntimeSpec {
                class: resolved.name.clone(),
                class_capabilities: class.spec.capabilities.clone(),
                resources: common.resources.clone(),
                image: obj.image().map(String::from),
                secret_data,
            },
            status: Default::default(),
        };

        let created = self.runtime.create(request).await?;
        info!(id = %created.metadata.id, class = %resolved.name, "Created runtime object");
        emit_event(
            self.events.as_ref(),
            obj.object_ref(&()),
            EventSeverity::Normal,
            "Provisioning",
            format!("created runtime object {}", created.metadata.id),
        )
        .await;
        Ok(created)
    }

    /// Mirror access data into a secret next to the request
    async fn ensure_access_secret(&self, obj: &K, access: &AccessInfo) -> Result<String> {
        let namespace = obj.meta().namespace.clone();
        let name = format!("{}-access", obj.object_name());

        match self.store.get_opt::<Secret>(namespace.as_deref(), &name).await? {
            Some(existing) if secret_payload(&existing) == *access => {}
            Some(_) => {
                let _: Secret = self
                    .store
                    .patch(namespace.as_deref(), &name, |s: &mut Secret| {
                        s.data = None;
                        s.string_data = Some(access.secret_data.clone());
                        true
                    })
                    .await?;
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace,
                        owner_references: obj.controller_owner_ref(&()).map(|o| vec![o]),
                        ..Default::default()
                    },
                    string_data: Some(access.secret_data.clone()),
                    ..Default::default()
                };
                self.store.create(&secret).await?;
            }
        }
        Ok(name)
    }

    async fn write_status(&self, obj: &K, key: &ObjectKey, current: &RuntimeObject, applied: ResourceList) -> Result<()> {
        let phase = match current.status.state {
            RuntimeState::Available => ResourcePhase::Available,
            RuntimeState::Error => ResourcePhase::Error,
            RuntimeState::Pending => ResourcePhase::Provisioning,
        };
        let access_ref = match &current.status.access {
            Some(access) => Some(self.ensure_access_secret(obj, access).await?),
            None => None,
        };
        let provider_id = Some(current.metadata.id.clone());

        let _: K = self
            .store
            .patch_status(key.namespace.as_deref(), &key.name, |r: &mut K| {
                let status = r.resource_status_mut();
                if status.phase == phase
                    && status.provider_id == provider_id
                    && status.access_secret_ref == access_ref
                    && status.applied_resources == applied
                {
                    return false;
                }
                status.phase = phase;
                status.provider_id = provider_id.clone();
                status.access_secret_ref = access_ref.clone();
                status.applied_resources = applied.clone();
                status.message = None;
                status.last_update_time = Some(Utc::now());
                true
            })
            .await?;

        if phase != obj.phase() && matches!(phase, ResourcePhase::Available | ResourcePhase::Error) {
            let severity = if phase == ResourcePhase::Error {
                EventSeverity::Warning
            } else {
                EventSeverity::Normal
            };
            emit_event(
                self.events.as_ref(),
                obj.object_ref(&()),
                severity,
                &phase.to_string(),
                format!("runtime object {} is {}", current.metadata.id, current.status.state),
            )
            .await;
        }
        Ok(())
    }
}

#[async_trait]
impl<K: PoolResource> Reconciler for ResourceReconciler<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    async fn map_event(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        let WatchEvent::Applied(obj) = event else {
            return Vec::new();
        };
        if event.kind() != Some(self.kind.as_str()) {
            return Vec::new();
        }
        match self.store.registry().decode::<K>(obj) {
            Ok(request) if self.is_ours(&request) => ObjectKey::of(obj).ok().into_iter().collect(),
            _ => Vec::new(),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(obj) = self.store.get_opt::<K>(key.namespace.as_deref(), &key.name).await? else {
            return Ok(Action::Done);
        };
        if !self.is_ours(&obj) {
            return Ok(Action::Done);
        }
        if !self.classes.has_synced() {
            return Err(Error::ClassesNotSynced {
                kind: K::RESOURCE_KIND.to_string(),
            });
        }
        if obj.is_deleting() {
            return self.finalize(&obj, key).await;
        }

        self.ensure_finalizer(key).await?;
        let uid = obj
            .meta()
            .uid
            .clone()
            .ok_or_else(|| Error::Internal(format!("{} {} has no uid", self.kind, key)))?;

        let current = match self.runtime.list(&Self::owner_filter(&uid)).await?.into_iter().next() {
            Some(current) => current,
            None => self.create_runtime_object(&obj, &uid).await?,
        };

        let desired = obj.common().resources.clone();
        if current.spec.resources != desired {
            self.runtime
                .update_resources(&current.metadata.id, desired.clone())
                .await
                .map_err(|e| Error::during("expand", &current.metadata.id, e))?;
            info!(id = %current.metadata.id, "Updated runtime resources");
        }

        self.write_status(&obj, key, &current, desired).await?;
        Ok(Action::Requeue(self.resync))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{ClassMapperConfig, RuntimeClassSource};
    use crate::crd::{PoolResourceSpec, ResourceKind, Volume};
    use crate::poollet::testing::{Backend, Front};
    use crate::store::{ListSelector, ResourceStore};
    use assert_matches::assert_matches;

    struct Fixture {
        backend: Backend,
        front: Front,
        mapper: Arc<ClassMapper>,
        reconciler: ResourceReconciler<Volume>,
    }

    async fn fixture() -> Fixture {
        let backend = Backend::new().await;
        let front = Backend::front_store();
        front.add_class("fast", 100, 1000).await;

        let runtime = backend.runtime().await;
        let mapper = Arc::new(ClassMapper::new(
            ResourceKind::Volume,
            Arc::new(RuntimeClassSource::new(runtime.clone())),
            ClassMapperConfig::default(),
        ));
        backend.add_pool("backend-a", &[("fast-backend", 10)]).await;
        mapper.refresh().await.unwrap();

        let config = PoolletConfig {
            pool_name: "pool-a".into(),
            ..Default::default()
        };
        let reconciler = ResourceReconciler::new(&config, front.store.clone(), front.memory.clone(), runtime, mapper.clone());
        Fixture {
            backend,
            front,
            mapper,
            reconciler,
        }
    }

    async fn place(front: &Front, name: &str, class: &str, pool: Option<&str>) -> ObjectKey {
        let mut vol = Volume::build(
            name,
            PoolResourceSpec {
                class_ref: class.into(),
                pool_ref: pool.map(String::from),
                resources: BTreeMap::from([("storage".to_string(), 100)]),
                ..Default::default()
            },
        );
        vol.metadata.namespace = Some("front".into());
        front.store.create(&vol).await.unwrap();
        ObjectKey::namespaced("Volume", "front", name)
    }

    async fn backend_volumes(backend: &Backend) -> Vec<Volume> {
        backend.store.list(Some("default"), &ListSelector::all()).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_expand_and_delete() {
        let fx = fixture().await;
        let key = place(&fx.front, "vol-1", "fast", Some("pool-a")).await;

        assert_matches!(fx.reconciler.reconcile(&key).await, Ok(Action::Requeue(_)));
        let backend = backend_volumes(&fx.backend).await;
        assert_eq!(backend.len(), 1);
        assert_eq!(backend[0].common().class_ref, "fast-backend");
        assert_eq!(backend[0].common().resources, BTreeMap::from([("storage".to_string(), 100)]));

        let front: Volume = fx.front.store.get(Some("front"), "vol-1").await.unwrap();
        assert_eq!(front.meta().finalizers.as_deref(), Some(&[FINALIZER.to_string()][..]));
        let status = front.resource_status().unwrap();
        assert_eq!(status.phase, ResourcePhase::Provisioning);
        assert_eq!(status.provider_id.as_deref(), Some(backend[0].object_name()));

        // Expand in place
        let _: Volume = fx
            .front
            .store
            .patch(Some("front"), "vol-1", |v: &mut Volume| {
                v.common_mut().resources.insert("storage".into(), 200);
                true
            })
            .await
            .unwrap();
        fx.reconciler.reconcile(&key).await.unwrap();
        let after = backend_volumes(&fx.backend).await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].object_name(), backend[0].object_name());
        assert_eq!(after[0].common().resources.get("storage"), Some(&200));

        // Backend reports availability
        let _: Volume = fx
            .backend
            .store
            .patch_status(Some("default"), backend[0].object_name(), |v: &mut Volume| {
                v.resource_status_mut().phase = ResourcePhase::Available;
                true
            })
            .await
            .unwrap();
        fx.reconciler.reconcile(&key).await.unwrap();
        let front: Volume = fx.front.store.get(Some("front"), "vol-1").await.unwrap();
        assert_eq!(front.phase(), ResourcePhase::Available);
        assert_eq!(
            front.resource_status().unwrap().applied_resources.get("storage"),
            Some(&200)
        );
        assert!(fx.front.memory.recorded_events().iter().any(|e| e.reason == "Available"));

        // Delete goes through the finalizer
        fx.front.store.delete::<Volume>(Some("front"), "vol-1").await.unwrap();
        assert_eq!(fx.front.memory.count("Volume"), 1);
        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(backend_volumes(&fx.backend).await.is_empty());
        assert_eq!(fx.front.memory.count("Volume"), 0);
    }

    #[tokio::test]
    async fn test_access_data_is_mirrored() {
        let fx = fixture().await;
        let key = place(&fx.front, "vol-1", "fast", Some("pool-a")).await;
        fx.reconciler.reconcile(&key).await.unwrap();

        let id = backend_volumes(&fx.backend).await[0].object_name().to_string();
        let _: Volume = fx
            .backend
            .store
            .patch_status(Some("default"), &id, |v: &mut Volume| {
                v.resource_status_mut().phase = ResourcePhase::Available;
                true
            })
            .await
            .unwrap();
        fx.backend
            .store
            .create(&Secret {
                metadata: ObjectMeta {
                    name: Some(format!("{}-access", id)),
                    namespace: Some("default".into()),
                    ..Default::default()
                },
                string_data: Some(BTreeMap::from([("target".to_string(), "iqn.2024-01.local:vol".to_string())])),
                ..Default::default()
            })
            .await
            .unwrap();

        fx.reconciler.reconcile(&key).await.unwrap();
        let front: Volume = fx.front.store.get(Some("front"), "vol-1").await.unwrap();
        assert_eq!(
            front.resource_status().unwrap().access_secret_ref.as_deref(),
            Some("vol-1-access")
        );
        let secret: Secret = fx.front.store.get(Some("front"), "vol-1-access").await.unwrap();
        assert_eq!(secret_payload(&secret).secret_data["target"], "iqn.2024-01.local:vol");
        assert_eq!(secret.metadata.owner_references.unwrap()[0].uid, front.metadata.uid.unwrap());
    }

    #[tokio::test]
    async fn test_other_pools_and_unplaced_are_ignored() {
        let fx = fixture().await;
        let elsewhere = place(&fx.front, "vol-1", "fast", Some("pool-b")).await;
        let unplaced = place(&fx.front, "vol-2", "fast", None).await;

        assert_matches!(fx.reconciler.reconcile(&elsewhere).await, Ok(Action::Done));
        assert_matches!(fx.reconciler.reconcile(&unplaced).await, Ok(Action::Done));
        assert!(backend_volumes(&fx.backend).await.is_empty());

        let event = WatchEvent::Applied(fx.front.memory.get(&elsewhere).await.unwrap());
        assert!(fx.reconciler.map_event(&event).await.is_empty());
    }

    #[tokio::test]
    async fn test_undefined_class_creates_nothing() {
        let fx = fixture().await;
        let key = place(&fx.front, "vol-1", "gold", Some("pool-a")).await;

        let err = fx.reconciler.reconcile(&key).await.unwrap_err();
        assert!(err.is_class_unresolved());
        assert!(backend_volumes(&fx.backend).await.is_empty());
        assert!(fx.mapper.has_synced());
    }

    #[tokio::test]
    async fn test_waits_for_class_sync() {
        let backend = Backend::new().await;
        let front = Backend::front_store();
        let runtime = backend.runtime().await;
        let mapper = Arc::new(ClassMapper::new(
            ResourceKind::Volume,
            Arc::new(RuntimeClassSource::new(runtime.clone())),
            ClassMapperConfig::default(),
        ));
        let config = PoolletConfig {
            pool_name: "pool-a".into(),
            ..Default::default()
        };
        let reconciler: ResourceReconciler<Volume> =
            ResourceReconciler::new(&config, front.store.clone(), front.memory.clone(), runtime, mapper);
        let key = place(&front, "vol-1", "fast", Some("pool-a")).await;

        assert_matches!(reconciler.reconcile(&key).await, Err(Error::ClassesNotSynced { .. }));
    }
}

use super::aggregate::{access_secret_name, secret_payload, Aggregate, Rollback};
use super::convert::{is_owned_and_created, to_runtime_object, LabelSnapshot, CREATED_ANNOTATION, MANAGER_LABEL};
use super::BrokerConfig;
use crate::classes::ClassMapper;
use crate::crd::{PoolResource, ResourceKind, ResourceList, ResourcePhase, ResourcePool};
use crate::domain::ports::{
    AccessInfo, ClassInfo, ClassStatus, EventFilter, ListFilter, PoolTarget, Runtime, RuntimeEvent,
    RuntimeObject, RuntimeSpec,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::store::{labels_match, EventSinkRef, ListSelector, ObjectKey, TypedStore};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runtime protocol server for one request kind, backed by a store.
///
/// Objects are visible only when they carry this broker's manager label and
/// the created flag; everything else is reported as not found.
pub struct Broker<K: PoolResource> {
    config: BrokerConfig,
    store: TypedStore,
    events: EventSinkRef,
    classes: Arc<ClassMapper>,
    metrics: Option<Arc<Metrics>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: PoolResource> Broker<K> {
    pub fn new(config: BrokerConfig, store: TypedStore, events: EventSinkRef, classes: Arc<ClassMapper>) -> Self {
        Self {
            config,
            store,
            events,
            classes,
            metrics: None,
            _kind: PhantomData,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn namespace(&self) -> Option<&str> {
        Some(self.config.namespace.as_str())
    }

    fn key_of(&self, kind: &str, name: &str) -> ObjectKey {
        ObjectKey::namespaced(kind, self.config.namespace.clone(), name)
    }

    fn not_found(&self, id: &str) -> Error {
        Error::not_found(K::kind(&()).to_string(), id)
    }

    /// Resolve the requested class against the backend classes. A request
    /// without capabilities is matched by name only.
    fn resolve_class(&self, spec: &RuntimeSpec) -> Result<ClassInfo> {
        if !spec.class_capabilities.is_empty() {
            return self.classes.resolve(&spec.class, &spec.class_capabilities);
        }
        if !self.classes.has_synced() {
            return Err(Error::ClassesNotSynced {
                kind: K::RESOURCE_KIND.to_string(),
            });
        }
        self.classes.get(&spec.class).ok_or_else(|| Error::NoMatchingClass {
            kind: K::RESOURCE_KIND.to_string(),
            name: spec.class.clone(),
            signature: "(any)".to_string(),
        })
    }

    /// Fetch an object that is ours, or not-found
    async fn owned(&self, id: &str) -> Result<K> {
        match self.store.get_opt::<K>(self.namespace(), id).await? {
            Some(obj) if is_owned_and_created(obj.meta(), &self.config.manager) => Ok(obj),
            _ => Err(self.not_found(id)),
        }
    }

    /// Create an aggregate, aborting at the next step boundary once `cancel`
    /// fires. Completed steps are rolled back on any failure.
    #[instrument(skip_all, fields(kind = %K::RESOURCE_KIND, class = %object.spec.class))]
    pub async fn create_with(&self, object: RuntimeObject, cancel: &CancellationToken) -> Result<RuntimeObject> {
        let class = self.resolve_class(&object.spec)?;
        let Aggregate { primary, secret } = Aggregate::<K>::assemble(&self.config, &class, &object)?;
        let id = primary.object_name().to_string();
        let mut rollback = Rollback::new(self.store.store().clone(), self.config.cleanup_timeout);

        // Secondary objects first; the primary references them by name
        let secret_name = match secret {
            Some(secret) => {
                let name = secret.metadata.name.clone().unwrap_or_default();
                let key = self.key_of("Secret", &name);
                rollback.track(key.clone());
                if let Err(e) = step(cancel, self.store.create(&secret)).await {
                    forget_if_taken(&mut rollback, &key, &e);
                    return Err(self.abort(rollback, "create secret", &name, e).await);
                }
                Some(name)
            }
            None => None,
        };

        let key = self.key_of(&K::kind(&()), &id);
        rollback.track(key.clone());
        let created = match step(cancel, self.store.create(&primary)).await {
            Ok(created) => created,
            Err(e) => {
                forget_if_taken(&mut rollback, &key, &e);
                return Err(self.abort(rollback, "create", &id, e).await);
            }
        };

        if let Some(name) = &secret_name {
            let Some(owner) = created.controller_owner_ref(&()) else {
                let e = Error::Internal(format!("created {} {} has no uid", K::kind(&()), id));
                return Err(self.abort(rollback, "own secret", name, e).await);
            };
            let owned = self.store.patch(self.namespace(), name, |s: &mut Secret| {
                let refs = s.metadata.owner_references.get_or_insert_with(Vec::new);
                if refs.iter().any(|r| r.uid == owner.uid) {
                    return false;
                }
                refs.push(owner.clone());
                true
            });
            if let Err(e) = step(cancel, owned).await {
                return Err(self.abort(rollback, "own secret", name, e).await);
            }
        }

        let flagged = self.store.patch(self.namespace(), &id, |obj: &mut K| {
            let annotations = obj.meta_mut().annotations.get_or_insert_with(BTreeMap::new);
            annotations
                .insert(CREATED_ANNOTATION.to_string(), "true".to_string())
                .as_deref()
                != Some("true")
        });
        let primary: K = match step(cancel, flagged).await {
            Ok(primary) => primary,
            Err(e) => return Err(self.abort(rollback, "mark created", &id, e).await),
        };
        rollback.commit();
        info!(id = %id, class = %class.name, "Created aggregate");

        // The object exists from here on; a failed access fetch is reported
        // without undoing it
        let access = self
            .access_info(&primary)
            .await
            .map_err(|e| Error::during("fetch access secret", &id, e))?;
        to_runtime_object(&primary, access)
    }

    async fn abort(&self, rollback: Rollback, operation: &str, name: &str, error: Error) -> Error {
        if !rollback.is_empty() {
            warn!(operation, name, error = %error, "Create step failed, rolling back");
            if let Some(metrics) = &self.metrics {
                metrics.inc_rollbacks();
            }
            rollback.unwind().await;
        }
        Error::during(operation, format!("{} {}", K::RESOURCE_KIND, name), error)
    }

    /// Access data for an available object. Buckets must have it once
    /// available; for other kinds it is optional.
    async fn access_info(&self, obj: &K) -> Result<Option<AccessInfo>> {
        if obj.phase() != ResourcePhase::Available {
            return Ok(None);
        }
        let name = access_secret_name(obj.object_name());
        match self.store.get_opt::<Secret>(self.namespace(), &name).await? {
            Some(secret) => Ok(Some(secret_payload(&secret))),
            None if K::RESOURCE_KIND == ResourceKind::Bucket => Err(Error::MissingSecondary {
                kind: K::RESOURCE_KIND.to_string(),
                id: obj.object_name().to_string(),
                name,
            }),
            None => Ok(None),
        }
    }

    /// Protocol view of one aggregate, following its secret reference
    async fn view(&self, obj: &K) -> Result<RuntimeObject> {
        if let Some(name) = &obj.common().secret_ref {
            if self.store.get_opt::<Secret>(self.namespace(), name).await?.is_none() {
                return Err(Error::MissingSecondary {
                    kind: K::RESOURCE_KIND.to_string(),
                    id: obj.object_name().to_string(),
                    name: name.clone(),
                });
            }
        }
        let access = self.access_info(obj).await?;
        to_runtime_object(obj, access)
    }

    /// Every aggregate this broker owns
    async fn owned_objects(&self) -> Result<Vec<K>> {
        let selector = ListSelector::all().with_label(MANAGER_LABEL, self.config.manager.clone());
        let objects: Vec<K> = self.store.list(self.namespace(), &selector).await?;
        Ok(objects
            .into_iter()
            .filter(|o| is_owned_and_created(o.meta(), &self.config.manager))
            .collect())
    }

    async fn target_pools(&self, target: &PoolTarget) -> Result<Vec<ResourcePool>> {
        let pools = if target.names.is_empty() {
            self.store
                .list::<ResourcePool>(None, &ListSelector::labels(target.selector.clone()))
                .await?
        } else {
            let mut pools = Vec::with_capacity(target.names.len());
            for name in &target.names {
                match self.store.get_opt::<ResourcePool>(None, name).await? {
                    Some(pool) => pools.push(pool),
                    None => debug!(pool = %name, "Target pool not found"),
                }
            }
            pools
        };
        Ok(pools
            .into_iter()
            .filter(|p| p.spec.kind == K::RESOURCE_KIND && !p.is_deleting())
            .collect())
    }
}

/// Await a store step unless `cancel` fires first
async fn step<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled("create".to_string())),
        result = fut => result,
    }
}

/// A create rejected because the name exists wrote nothing of ours
fn forget_if_taken(rollback: &mut Rollback, key: &ObjectKey, error: &Error) {
    if matches!(error.root(), Error::ResourceExists { .. }) {
        rollback.forget(key);
    }
}

/// Sum pool capacity per class.
///
/// A class is reported when some pool exposes it and at least one pool has a
/// quantity entry for it. Classes exposed without any quantity are omitted.
pub fn aggregate_status(classes: &[ClassInfo], pools: &[ResourcePool]) -> Vec<ClassStatus> {
    let mut quantities: BTreeMap<&str, i64> = BTreeMap::new();
    for class in classes {
        for pool in pools.iter().filter(|p| p.offers_class(&class.name)) {
            if let Some(quantity) = pool.allocatable(&class.name) {
                *quantities.entry(class.name.as_str()).or_default() += quantity;
            }
        }
    }
    classes
        .iter()
        .filter_map(|class| {
            quantities.get(class.name.as_str()).map(|quantity| ClassStatus {
                class: class.clone(),
                quantity: *quantity,
            })
        })
        .collect()
}

#[async_trait]
impl<K: PoolResource> Runtime for Broker<K> {
    fn kind(&self) -> ResourceKind {
        K::RESOURCE_KIND
    }

    async fn create(&self, object: RuntimeObject) -> Result<RuntimeObject> {
        let cancel = CancellationToken::new();
        match tokio::time::timeout(self.config.create_timeout, self.create_with(object, &cancel)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled(format!(
                "create {} timed out after {:?}",
                K::RESOURCE_KIND,
                self.config.create_timeout
            ))),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeObject>> {
        if let Some(id) = &filter.id {
            let obj = match self.owned(id).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let view = self.view(&obj).await?;
            return Ok(if labels_match(&filter.label_selector, &view.metadata.labels) {
                vec![view]
            } else {
                Vec::new()
            });
        }

        let mut result = Vec::new();
        for obj in self.owned_objects().await? {
            match self.view(&obj).await {
                Ok(view) if labels_match(&filter.label_selector, &view.metadata.labels) => result.push(view),
                Ok(_) => {}
                Err(e) => warn!(id = %obj.object_name(), error = %e, "Skipping broken aggregate"),
            }
        }
        Ok(result)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.owned(id).await?;
        self.store
            .delete::<K>(self.namespace(), id)
            .await
            .map_err(|e| Error::during("delete", format!("{} {}", K::RESOURCE_KIND, id), e))?;
        info!(kind = %K::RESOURCE_KIND, id, "Deleted aggregate");
        Ok(())
    }

    async fn update_resources(&self, id: &str, resources: ResourceList) -> Result<()> {
        self.owned(id).await?;
        self.store
            .patch(self.namespace(), id, |obj: &mut K| {
                if obj.common().resources == resources {
                    return false;
                }
                obj.common_mut().resources = resources.clone();
                true
            })
            .await
            .map(|_: K| ())
            .map_err(|e| Error::during("update resources", format!("{} {}", K::RESOURCE_KIND, id), e))
    }

    async fn status(&self, target: &PoolTarget) -> Result<Vec<ClassStatus>> {
        if !self.classes.has_synced() {
            return Err(Error::ClassesNotSynced {
                kind: K::RESOURCE_KIND.to_string(),
            });
        }
        let pools = self.target_pools(target).await?;
        Ok(aggregate_status(&self.classes.classes(), &pools))
    }

    async fn list_classes(&self) -> Result<Vec<ClassInfo>> {
        if !self.classes.has_synced() {
            return Err(Error::ClassesNotSynced {
                kind: K::RESOURCE_KIND.to_string(),
            });
        }
        Ok(self.classes.classes())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<RuntimeEvent>> {
        let kind = K::kind(&()).to_string();
        let mut labels_by_id: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        for obj in self.owned_objects().await? {
            match LabelSnapshot::decode_from(obj.meta()) {
                Ok(snapshot) => {
                    labels_by_id.insert(obj.object_name().to_string(), snapshot.labels);
                }
                Err(e) => warn!(id = %obj.object_name(), error = %e, "Skipping events of broken aggregate"),
            }
        }

        let events = self.events.list_events(filter.from, filter.to).await?;
        Ok(events
            .into_iter()
            .filter(|e| {
                e.regarding.kind.as_deref() == Some(kind.as_str())
                    && e.regarding.namespace.as_deref() == self.namespace()
            })
            .filter_map(|e| {
                let labels = labels_by_id.get(e.regarding.name.as_deref()?)?;
                if !labels_match(&filter.label_selector, labels) {
                    return None;
                }
                Some(RuntimeEvent {
                    labels: labels.clone(),
                    severity: e.severity,
                    reason: e.reason,
                    message: e.message,
                    event_time: e.timestamp,
                })
            })
            .collect())
    }
}

//! In-memory Resource Store
//!
//! Holds versioned [`DynamicObject`]s keyed by kind/namespace/name and
//! models the store guarantees the controllers depend on:
//! - optimistic concurrency through resource versions
//! - status kept apart from spec/metadata updates
//! - finalizers delaying removal until they are cleared
//! - owner-reference garbage collection: removing object A removes every
//!   object whose owner list contains A's uid
//! - a broadcast watch stream and an event log

use super::{in_window, EventSink, ListSelector, ObjectKey, ResourceStore, StoredEvent, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const WATCH_CAPACITY: usize = 1024;

/// Settings of the in-memory store used in standalone mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryStoreConfig {
    /// Events kept before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { event_capacity: 10_000 }
    }
}

/// Store operation, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// Error an injected failure produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Permanent internal error
    Internal,
    /// Stale resource version, as if another writer got there first
    Conflict,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: StoreOp,
    kind: String,
    failure: Failure,
}

/// In-process implementation of [`ResourceStore`] and [`EventSink`]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, DynamicObject>>,
    version: AtomicU64,
    watch_tx: broadcast::Sender<WatchEvent>,
    events: RwLock<VecDeque<StoredEvent>>,
    event_capacity: usize,
    failures: RwLock<Vec<InjectedFailure>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            watch_tx,
            events: RwLock::new(VecDeque::new()),
            event_capacity: MemoryStoreConfig::default().event_capacity,
            failures: RwLock::new(Vec::new()),
        }
    }

    /// Create an empty store with the given settings
    pub fn with_config(config: &MemoryStoreConfig) -> Self {
        Self::new().with_event_capacity(config.event_capacity)
    }

    /// Keep at most `capacity` recorded events, dropping the oldest
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Make the next `op` on `kind` fail with an internal error
    pub fn fail_next(&self, op: StoreOp, kind: impl Into<String>) {
        self.fail_next_with(op, kind, Failure::Internal);
    }

    /// Make the next `op` on `kind` fail with the given failure
    pub fn fail_next_with(&self, op: StoreOp, kind: impl Into<String>, failure: Failure) {
        self.failures.write().push(InjectedFailure {
            op,
            kind: kind.into(),
            failure,
        });
    }

    /// Number of stored objects of a kind
    pub fn count(&self, kind: &str) -> usize {
        self.objects.read().keys().filter(|k| k.kind == kind).count()
    }

    /// All recorded events
    pub fn recorded_events(&self) -> Vec<StoredEvent> {
        self.events.read().iter().cloned().collect()
    }

    fn check_failure(&self, op: StoreOp, kind: &str) -> Result<()> {
        let mut failures = self.failures.write();
        if let Some(pos) = failures.iter().position(|f| f.op == op && f.kind == kind) {
            let injected = failures.remove(pos);
            return Err(match injected.failure {
                Failure::Internal => Error::Internal(format!("injected {:?} failure for {}", op, kind)),
                Failure::Conflict => Error::Conflict {
                    kind: kind.to_string(),
                    name: format!("injected {:?}", op),
                },
            });
        }
        Ok(())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No receivers is fine
            let _ = self.watch_tx.send(event);
        }
    }

    fn check_version(key: &ObjectKey, incoming: &DynamicObject, stored: &DynamicObject) -> Result<()> {
        match &incoming.metadata.resource_version {
            Some(rv) if Some(rv) != stored.metadata.resource_version.as_ref() => Err(Error::Conflict {
                kind: key.kind.clone(),
                name: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Remove or mark an object for deletion, cascading to dependents
    fn remove_locked(
        &self,
        objects: &mut BTreeMap<ObjectKey, DynamicObject>,
        key: &ObjectKey,
        events: &mut Vec<WatchEvent>,
    ) {
        let Some(obj) = objects.get_mut(key) else {
            return;
        };

        let has_finalizers = obj
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            if obj.metadata.deletion_timestamp.is_none() {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                obj.metadata.resource_version = Some(self.next_version());
                events.push(WatchEvent::Applied(obj.clone()));
            }
            return;
        }

        let Some(removed) = objects.remove(key) else {
            return;
        };
        debug!(kind = %key.kind, key = %key, "Removed object");
        let uid = removed.metadata.uid.clone();
        events.push(WatchEvent::Deleted(removed));

        let Some(uid) = uid else {
            return;
        };
        let dependents: Vec<ObjectKey> = objects
            .iter()
            .filter(|(_, o)| {
                o.metadata
                    .owner_references
                    .as_ref()
                    .map(|refs| refs.iter().any(|r| r.uid == uid))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dependent in dependents {
            trace!(owner = %key, dependent = %dependent, "Collecting dependent");
            self.remove_locked(objects, &dependent, events);
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        self.check_failure(StoreOp::Get, &key.kind)?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| key.not_found())
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>> {
        self.check_failure(StoreOp::List, kind)?;
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| selector.matches(o))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        self.check_failure(StoreOp::Create, &key.kind)?;

        let created = {
            let mut objects = self.objects.write();
            if objects.contains_key(&key) {
                return Err(Error::ResourceExists {
                    kind: key.kind.clone(),
                    name: key.to_string(),
                });
            }
            let version = self.next_version();
            obj.metadata.uid = Some(format!("{:016x}-{}", rand::random::<u64>(), version));
            obj.metadata.resource_version = Some(version);
            obj.metadata.creation_timestamp = Some(Time(Utc::now()));
            obj.metadata.deletion_timestamp = None;
            obj.metadata.generation = Some(1);
            objects.insert(key.clone(), obj.clone());
            obj
        };

        debug!(kind = %key.kind, key = %key, "Created object");
        self.publish(vec![WatchEvent::Applied(created.clone())]);
        Ok(created)
    }

    async fn update(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        self.check_failure(StoreOp::Update, &key.kind)?;

        let mut events = Vec::new();
        let result = {
            let mut objects = self.objects.write();
            let stored = objects.get(&key).ok_or_else(|| key.not_found())?;
            Self::check_version(&key, &obj, stored)?;

            // Server-owned fields
            obj.metadata.uid = stored.metadata.uid.clone();
            obj.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
            obj.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
            let spec_changed = obj.data.get("spec") != stored.data.get("spec");
            obj.metadata.generation = stored
                .metadata
                .generation
                .map(|g| if spec_changed { g + 1 } else { g });
            match stored.data.get("status") {
                Some(status) => obj.data["status"] = status.clone(),
                None => {
                    if let Some(data) = obj.data.as_object_mut() {
                        data.remove("status");
                    }
                }
            }
            obj.metadata.resource_version = Some(self.next_version());

            let finalized = obj.metadata.deletion_timestamp.is_some()
                && obj
                    .metadata
                    .finalizers
                    .as_ref()
                    .map(|f| f.is_empty())
                    .unwrap_or(true);

            objects.insert(key.clone(), obj.clone());
            if finalized {
                self.remove_locked(&mut objects, &key, &mut events);
            } else {
                events.push(WatchEvent::Applied(obj.clone()));
            }
            obj
        };

        trace!(kind = %key.kind, key = %key, "Updated object");
        self.publish(events);
        Ok(result)
    }

    async fn update_status(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        self.check_failure(StoreOp::UpdateStatus, &key.kind)?;

        let updated = {
            let mut objects = self.objects.write();
            let version = self.next_version();
            let stored = objects.get_mut(&key).ok_or_else(|| key.not_found())?;
            Self::check_version(&key, &obj, stored)?;

            match obj.data.get("status") {
                Some(status) => stored.data["status"] = status.clone(),
                None => {
                    if let Some(data) = stored.data.as_object_mut() {
                        data.remove("status");
                    }
                }
            }
            stored.metadata.resource_version = Some(version);
            stored.clone()
        };

        trace!(kind = %key.kind, key = %key, "Updated status");
        self.publish(vec![WatchEvent::Applied(updated.clone())]);
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.check_failure(StoreOp::Delete, &key.kind)?;

        let mut events = Vec::new();
        {
            let mut objects = self.objects.write();
            if !objects.contains_key(key) {
                return Err(key.not_found());
            }
            self.remove_locked(&mut objects, key, &mut events);
        }
        self.publish(events);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn record(&self, event: StoredEvent) -> Result<()> {
        trace!(reason = %event.reason, "Recorded event");
        let mut events = self.events.write();
        while events.len() >= self.event_capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    async fn list_events(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| in_window(e.timestamp, from, to))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn volume_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("pool-broker.io", "v1alpha1", "Volume"))
    }

    fn secret_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Secret"))
    }

    fn volume(name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &volume_resource()).within("default");
        obj.data = json!({"spec": {"classRef": "fast"}});
        obj
    }

    fn volume_key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("Volume", "default", name)
    }

    #[tokio::test]
    async fn test_create_get_conflict() {
        let store = MemoryStore::new();
        let created = store.create(volume("vol-1")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_matches!(
            store.create(volume("vol-1")).await,
            Err(Error::ResourceExists { .. })
        );

        let mut first = store.get(&volume_key("vol-1")).await.unwrap();
        let mut second = first.clone();

        first.data["spec"]["classRef"] = json!("slow");
        store.update(first).await.unwrap();

        second.data["spec"]["classRef"] = json!("medium");
        assert_matches!(store.update(second).await, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_keeps_status_and_status_update_keeps_spec() {
        let store = MemoryStore::new();
        let mut obj = store.create(volume("vol-1")).await.unwrap();
        obj.data["status"] = json!({"phase": "Pending"});
        let obj = store.update_status(obj).await.unwrap();

        let mut spec_change = obj.clone();
        spec_change.data["spec"]["classRef"] = json!("slow");
        spec_change.data["status"] = json!({"phase": "Error"});
        let updated = store.update(spec_change).await.unwrap();
        assert_eq!(updated.data["status"]["phase"], "Pending");
        assert_eq!(updated.data["spec"]["classRef"], "slow");
        assert_eq!(updated.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_owner_cascade() {
        let store = MemoryStore::new();
        let owner = store.create(volume("vol-1")).await.unwrap();

        let mut secret = DynamicObject::new("vol-1-key", &secret_resource()).within("default");
        secret.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "pool-broker.io/v1alpha1".into(),
            kind: "Volume".into(),
            name: "vol-1".into(),
            uid: owner.metadata.uid.clone().unwrap(),
            ..Default::default()
        }]);
        store.create(secret).await.unwrap();
        assert_eq!(store.count("Secret"), 1);

        store.delete(&volume_key("vol-1")).await.unwrap();
        assert_eq!(store.count("Secret"), 0);
        assert_eq!(store.count("Volume"), 0);
        assert!(store.delete(&volume_key("vol-1")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_finalizer_delays_removal() {
        let store = MemoryStore::new();
        let mut obj = volume("vol-1");
        obj.metadata.finalizers = Some(vec!["pool-broker.io/poollet".into()]);
        store.create(obj).await.unwrap();

        store.delete(&volume_key("vol-1")).await.unwrap();
        let mut marked = store.get(&volume_key("vol-1")).await.unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = Some(vec![]);
        store.update(marked).await.unwrap();
        assert!(store.get(&volume_key("vol-1")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_event_log_drops_oldest_past_capacity() {
        use crate::domain::ports::EventSeverity;
        use k8s_openapi::api::core::v1::ObjectReference;

        let store = MemoryStore::new().with_event_capacity(3);
        let start = Utc::now();
        for i in 0..5 {
            store
                .record(StoredEvent {
                    regarding: ObjectReference::default(),
                    severity: EventSeverity::Normal,
                    reason: format!("Step{}", i),
                    message: String::new(),
                    timestamp: start + chrono::Duration::seconds(i),
                })
                .await
                .unwrap();
        }
        let reasons: Vec<_> = store
            .list_events(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.reason)
            .collect();
        assert_eq!(reasons, vec!["Step2", "Step3", "Step4"]);
    }

    #[tokio::test]
    async fn test_watch_and_injected_failure() {
        let store = MemoryStore::new();
        let mut rx = store.watch();

        store.fail_next(StoreOp::Create, "Volume");
        assert_matches!(store.create(volume("vol-1")).await, Err(Error::Internal(_)));

        store.create(volume("vol-1")).await.unwrap();
        assert_matches!(rx.recv().await.unwrap(), WatchEvent::Applied(o) if o.metadata.name.as_deref() == Some("vol-1"));
    }
}

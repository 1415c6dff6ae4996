use super::CapabilitySignature;
use crate::crd::{Capabilities, ResourceKind};
use crate::domain::ports::{ClassInfo, ClassSource};
use crate::error::{Error, Result};
use crate::reconcile::run_periodic;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Class mapper tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassMapperConfig {
    /// Time between refreshes
    #[serde(with = "crate::config::duration_secs")]
    pub refresh_interval: Duration,
}

impl Default for ClassMapperConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
        }
    }
}

/// Both indices, always rebuilt together
#[derive(Debug, Default)]
struct ClassIndex {
    by_name: BTreeMap<String, ClassInfo>,
    by_signature: BTreeMap<CapabilitySignature, Vec<ClassInfo>>,
}

impl ClassIndex {
    fn build(kind: ResourceKind, classes: Vec<ClassInfo>) -> Self {
        let mut index = Self::default();
        for class in classes {
            let signature = CapabilitySignature::for_kind(kind, &class.capabilities);
            index
                .by_signature
                .entry(signature)
                .or_default()
                .push(class.clone());
            if let Some(previous) = index.by_name.insert(class.name.clone(), class) {
                warn!(kind = %kind, class = %previous.name, "Duplicate class name reported, keeping the last");
            }
        }
        index
    }
}

/// Resolves logical class names plus capabilities to runtime classes.
///
/// Refreshed on a fixed period from a [`ClassSource`]; `resolve` fails with
/// `ClassesNotSynced` until the first refresh succeeds.
pub struct ClassMapper {
    kind: ResourceKind,
    source: Arc<dyn ClassSource>,
    config: ClassMapperConfig,
    index: RwLock<ClassIndex>,
    synced: watch::Sender<bool>,
    /// Bumped whenever a refresh changes the class set
    changes: watch::Sender<u64>,
}

impl ClassMapper {
    pub fn new(kind: ResourceKind, source: Arc<dyn ClassSource>, config: ClassMapperConfig) -> Self {
        let (synced, _) = watch::channel(false);
        let (changes, _) = watch::channel(0);
        Self {
            kind,
            source,
            config,
            index: RwLock::new(ClassIndex::default()),
            synced,
            changes,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// List classes and swap in freshly built indices
    pub async fn refresh(&self) -> Result<()> {
        let classes = self.source.list_classes().await?;
        let count = classes.len();
        let index = ClassIndex::build(self.kind, classes);

        let changed = {
            let mut current = self.index.write();
            let changed = current.by_name != index.by_name;
            *current = index;
            changed
        };
        debug!(kind = %self.kind, classes = count, changed, "Refreshed class indices");
        if changed {
            self.changes.send_modify(|generation| *generation += 1);
        }

        let first = self.synced.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        });
        if first {
            info!(kind = %self.kind, classes = count, "Class mapper synced");
        }
        Ok(())
    }

    /// Whether the first refresh has completed
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Notified each time a refresh changes the class set. Reconcilers that
    /// gave up on an unresolved class use it to retry.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Block until the first refresh completes or `cancel` fires
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.synced.subscribe();
        loop {
            let synced = *rx.borrow_and_update();
            if synced {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("waiting for {} classes to sync", self.kind)));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Internal("class sync channel closed".into()));
                    }
                }
            }
        }
    }

    /// Resolve `name` with the requested capabilities.
    ///
    /// A class with that name and an equal signature wins. Otherwise exactly
    /// one class must share the signature.
    pub fn resolve(&self, name: &str, capabilities: &Capabilities) -> Result<ClassInfo> {
        if !self.has_synced() {
            return Err(Error::ClassesNotSynced {
                kind: self.kind.to_string(),
            });
        }

        let signature = CapabilitySignature::for_kind(self.kind, capabilities);
        let index = self.index.read();

        if let Some(class) = index.by_name.get(name) {
            if CapabilitySignature::for_kind(self.kind, &class.capabilities) == signature {
                return Ok(class.clone());
            }
        }

        match index.by_signature.get(&signature).map(Vec::as_slice) {
            None | Some([]) => Err(Error::NoMatchingClass {
                kind: self.kind.to_string(),
                name: name.to_string(),
                signature: signature.to_string(),
            }),
            Some([class]) => Ok(class.clone()),
            Some(candidates) => Err(Error::AmbiguousClass {
                kind: self.kind.to_string(),
                name: name.to_string(),
                candidates: candidates.iter().map(|c| c.name.clone()).collect(),
            }),
        }
    }

    /// Class by exact name
    pub fn get(&self, name: &str) -> Option<ClassInfo> {
        self.index.read().by_name.get(name).cloned()
    }

    /// Snapshot of all known classes, by name
    pub fn classes(&self) -> Vec<ClassInfo> {
        self.index.read().by_name.values().cloned().collect()
    }

    /// Refresh on the configured period until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let name = format!("{}-class-mapper", self.kind);
        let period = self.config.refresh_interval;
        run_periodic(&name, period, shutdown, || {
            let mapper = Arc::clone(&self);
            async move { mapper.refresh().await }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct StaticSource(Mutex<Vec<ClassInfo>>);

    #[async_trait]
    impl ClassSource for StaticSource {
        async fn list_classes(&self) -> Result<Vec<ClassInfo>> {
            Ok(self.0.lock().clone())
        }
    }

    fn class(name: &str, tps: i64, iops: i64) -> ClassInfo {
        ClassInfo::new(
            name,
            [("tps".to_string(), tps), ("iops".to_string(), iops)]
                .into_iter()
                .collect(),
        )
    }

    fn caps(tps: i64, iops: i64) -> Capabilities {
        class("", tps, iops).capabilities
    }

    fn mapper(classes: Vec<ClassInfo>) -> (Arc<StaticSource>, ClassMapper) {
        let source = Arc::new(StaticSource(Mutex::new(classes)));
        let mapper = ClassMapper::new(ResourceKind::Volume, source.clone(), ClassMapperConfig::default());
        (source, mapper)
    }

    #[tokio::test]
    async fn test_resolve_before_sync() {
        let (_, mapper) = mapper(vec![class("fast", 100, 1000)]);
        assert_matches!(mapper.resolve("fast", &caps(100, 1000)), Err(Error::ClassesNotSynced { .. }));
    }

    #[tokio::test]
    async fn test_resolve_by_name_then_signature() {
        let (_, mapper) = mapper(vec![class("fast", 100, 1000), class("slow", 10, 100)]);
        mapper.refresh().await.unwrap();

        assert_eq!(mapper.resolve("fast", &caps(100, 1000)).unwrap().name, "fast");
        // Unknown name falls back to the signature
        assert_eq!(mapper.resolve("turbo", &caps(100, 1000)).unwrap().name, "fast");
        // Known name with a different signature also falls back
        assert_eq!(mapper.resolve("fast", &caps(10, 100)).unwrap().name, "slow");
        assert_matches!(mapper.resolve("fast", &caps(1, 1)), Err(Error::NoMatchingClass { .. }));

        for _ in 0..10 {
            assert_eq!(mapper.resolve("turbo", &caps(100, 1000)).unwrap().name, "fast");
        }
    }

    #[tokio::test]
    async fn test_identical_signatures_are_ambiguous() {
        let (_, mapper) = mapper(vec![class("gold", 100, 1000), class("premium", 100, 1000)]);
        mapper.refresh().await.unwrap();

        assert_matches!(
            mapper.resolve("silver", &caps(100, 1000)),
            Err(Error::AmbiguousClass { candidates, .. }) if candidates == vec!["gold".to_string(), "premium".to_string()]
        );
        // Name match still short-circuits
        assert_eq!(mapper.resolve("gold", &caps(100, 1000)).unwrap().name, "gold");
    }

    #[tokio::test]
    async fn test_refresh_replaces_wholesale() {
        let (source, mapper) = mapper(vec![class("fast", 100, 1000)]);
        mapper.refresh().await.unwrap();
        assert!(mapper.get("fast").is_some());

        *source.0.lock() = vec![class("slow", 10, 100)];
        mapper.refresh().await.unwrap();
        assert!(mapper.get("fast").is_none());
        assert_eq!(mapper.classes().len(), 1);
        assert_matches!(mapper.resolve("fast", &caps(100, 1000)), Err(Error::NoMatchingClass { .. }));
    }

    #[tokio::test]
    async fn test_changes_signalled_only_when_classes_differ() {
        let (source, mapper) = mapper(vec![class("fast", 100, 1000)]);
        let mut changes = mapper.subscribe_changes();

        mapper.refresh().await.unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        mapper.refresh().await.unwrap();
        assert!(!changes.has_changed().unwrap());

        source.0.lock().push(class("slow", 10, 100));
        mapper.refresh().await.unwrap();
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_sync() {
        let (_, mapper) = mapper(vec![class("fast", 100, 1000)]);
        let mapper = Arc::new(mapper);

        let cancel = CancellationToken::new();
        let waiter = {
            let mapper = mapper.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { mapper.wait_for_sync(&cancel).await })
        };
        mapper.refresh().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(mapper.has_synced());

        // Second refresh does not re-signal, and waiting again returns at once
        mapper.refresh().await.unwrap();
        mapper.wait_for_sync(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_sync_cancelled() {
        let (_, mapper) = mapper(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_matches!(mapper.wait_for_sync(&cancel).await, Err(Error::Cancelled(_)));
    }
}

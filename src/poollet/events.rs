use super::{NAMESPACE_LABEL, NAME_LABEL, UID_LABEL};
use crate::crd::PoolResource;
use crate::domain::ports::{EventFilter, RuntimeEvent, RuntimeRef};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::reconcile::run_periodic;
use crate::store::{EventSinkRef, StoredEvent};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Event relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventRelayConfig {
    /// Time between runtime event fetches
    #[serde(with = "crate::config::duration_secs")]
    pub period: Duration,
}

impl Default for EventRelayConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
        }
    }
}

/// Copies runtime events onto the front objects they belong to.
///
/// Each pass fetches `[last, now)` and moves the watermark to `now` even if
/// the fetch fails, so events are delivered at most once.
pub struct EventRelay<K: PoolResource> {
    runtime: RuntimeRef,
    sink: EventSinkRef,
    config: EventRelayConfig,
    last_fetched: Mutex<DateTime<Utc>>,
    metrics: Option<Arc<Metrics>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: PoolResource> EventRelay<K> {
    pub fn new(runtime: RuntimeRef, sink: EventSinkRef, config: EventRelayConfig) -> Self {
        Self {
            runtime,
            sink,
            config,
            last_fetched: Mutex::new(Utc::now()),
            metrics: None,
            _kind: PhantomData,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One fetch-and-emit pass; returns the number of relayed events
    pub async fn relay_once(&self) -> Result<usize> {
        let now = Utc::now();
        let from = std::mem::replace(&mut *self.last_fetched.lock(), now);

        let events = self
            .runtime
            .list_events(&EventFilter {
                label_selector: Default::default(),
                from: Some(from),
                to: Some(now),
            })
            .await?;

        let mut relayed = 0;
        for event in events {
            let Some(regarding) = self.regarding(&event) else {
                trace!(reason = %event.reason, "Dropping event without owner labels");
                continue;
            };
            let stored = StoredEvent {
                regarding,
                severity: event.severity,
                reason: event.reason,
                message: event.message,
                timestamp: event.event_time,
            };
            match self.sink.record(stored).await {
                Ok(()) => relayed += 1,
                Err(e) => warn!(error = %e, "Failed to relay event"),
            }
        }

        if relayed > 0 {
            debug!(kind = %K::RESOURCE_KIND, relayed, "Relayed runtime events");
            if let Some(metrics) = &self.metrics {
                metrics.inc_relayed_events(relayed as u64);
            }
        }
        Ok(relayed)
    }

    /// Reference to the front object, built from the event labels alone
    fn regarding(&self, event: &RuntimeEvent) -> Option<ObjectReference> {
        let label = |key: &str| event.labels.get(key).filter(|v| !v.is_empty()).cloned();
        Some(ObjectReference {
            api_version: Some(K::api_version(&()).to_string()),
            kind: Some(K::kind(&()).to_string()),
            namespace: Some(label(NAMESPACE_LABEL)?),
            name: Some(label(NAME_LABEL)?),
            uid: Some(label(UID_LABEL)?),
            ..Default::default()
        })
    }

    /// Relay on the configured period until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let name = format!("{}-event-relay", K::RESOURCE_KIND);
        let period = self.config.period;
        run_periodic(&name, period, shutdown, || {
            let relay = Arc::clone(&self);
            async move { relay.relay_once().await.map(|_| ()) }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ResourceKind, ResourceList, Volume};
    use crate::domain::ports::{ClassInfo, ClassStatus, EventSeverity, ListFilter, PoolTarget, Runtime, RuntimeObject};
    use crate::error::Error;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Runtime that only serves events and remembers the windows it was asked for
    #[derive(Default)]
    struct EventSource {
        events: Mutex<Vec<RuntimeEvent>>,
        windows: Mutex<Vec<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>>,
        failing: Mutex<bool>,
    }

    #[async_trait]
    impl Runtime for EventSource {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Volume
        }

        async fn create(&self, _object: RuntimeObject) -> Result<RuntimeObject> {
            Err(Error::Internal("unsupported".into()))
        }

        async fn list(&self, _filter: &ListFilter) -> Result<Vec<RuntimeObject>> {
            Ok(Vec::new())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            Err(Error::not_found("Volume", id))
        }

        async fn update_resources(&self, id: &str, _resources: ResourceList) -> Result<()> {
            Err(Error::not_found("Volume", id))
        }

        async fn status(&self, _target: &PoolTarget) -> Result<Vec<ClassStatus>> {
            Ok(Vec::new())
        }

        async fn list_classes(&self) -> Result<Vec<ClassInfo>> {
            Ok(Vec::new())
        }

        async fn list_events(&self, filter: &EventFilter) -> Result<Vec<RuntimeEvent>> {
            self.windows.lock().push((filter.from, filter.to));
            if *self.failing.lock() {
                return Err(Error::RuntimeApi {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(std::mem::take(&mut *self.events.lock()))
        }
    }

    fn event(labels: &[(&str, &str)], reason: &str) -> RuntimeEvent {
        RuntimeEvent {
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
            severity: EventSeverity::Warning,
            reason: reason.into(),
            message: "disk attach failed".into(),
            event_time: Utc::now(),
        }
    }

    fn relay() -> (Arc<EventSource>, Arc<MemoryStore>, EventRelay<Volume>) {
        let source = Arc::new(EventSource::default());
        let sink = Arc::new(MemoryStore::new());
        let relay = EventRelay::new(source.clone(), sink.clone(), EventRelayConfig::default());
        (source, sink, relay)
    }

    #[tokio::test]
    async fn test_relays_labelled_events_and_drops_the_rest() {
        let (source, sink, relay) = relay();
        *source.events.lock() = vec![
            event(
                &[(NAMESPACE_LABEL, "front"), (NAME_LABEL, "vol-1"), (UID_LABEL, "uid-1")],
                "AttachFailed",
            ),
            event(&[(NAMESPACE_LABEL, "front"), (NAME_LABEL, "vol-2")], "Orphan"),
            event(&[], "Anonymous"),
        ];

        assert_eq!(relay.relay_once().await.unwrap(), 1);
        let recorded = sink.recorded_events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].reason, "AttachFailed");
        assert_eq!(recorded[0].severity, EventSeverity::Warning);
        assert_eq!(recorded[0].regarding.kind.as_deref(), Some("Volume"));
        assert_eq!(recorded[0].regarding.namespace.as_deref(), Some("front"));
        assert_eq!(recorded[0].regarding.name.as_deref(), Some("vol-1"));
        assert_eq!(recorded[0].regarding.uid.as_deref(), Some("uid-1"));
    }

    #[tokio::test]
    async fn test_watermark_advances_on_failure() {
        let (source, _sink, relay) = relay();
        *source.failing.lock() = true;
        assert!(relay.relay_once().await.is_err());
        *source.failing.lock() = false;
        relay.relay_once().await.unwrap();

        let windows = source.windows.lock().clone();
        assert_eq!(windows.len(), 2);
        // Second window starts where the failed one ended
        assert_eq!(windows[1].0, windows[0].1);
        assert!(windows[0].0 <= windows[0].1);
    }
}

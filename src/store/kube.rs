//! Kubernetes-backed Resource Store
//!
//! Implements [`ResourceStore`] over `kube::Api<DynamicObject>` for every
//! registered kind, feeds the watch stream from `kube::runtime::watcher`, and
//! records events through the events.k8s.io API.

use super::{
    format_selector, in_window, type_meta, EventSink, ListSelector, ObjectKey, Registry,
    ResourceStore, StoredEvent, WatchEvent,
};
use crate::domain::ports::EventSeverity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::events::v1::Event as K8sEvent;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WATCH_CAPACITY: usize = 1024;

/// [`ResourceStore`] backed by a live cluster
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<Registry>,
    reporter: Reporter,
    watch_tx: broadcast::Sender<WatchEvent>,
}

impl KubeStore {
    pub fn new(client: Client, registry: Arc<Registry>, controller: impl Into<String>) -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            client,
            registry,
            reporter: Reporter {
                controller: controller.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            watch_tx,
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster config
    pub async fn try_default(registry: Arc<Registry>, controller: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, registry, controller))
    }

    fn api(&self, kind: &str, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource)> {
        let registered = self.registry.get(kind)?;
        let resource = registered.resource.clone();
        let api = match (registered.is_namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        };
        Ok((api, resource))
    }

    /// Spawn one watcher per kind, feeding the broadcast stream until cancelled
    pub fn start_watches<'a>(&self, kinds: impl IntoIterator<Item = &'a str>, shutdown: CancellationToken) -> Result<()> {
        for kind in kinds {
            let (api, resource) = self.api(kind, None)?;
            let tx = self.watch_tx.clone();
            let shutdown = shutdown.clone();
            let kind = kind.to_string();
            info!(kind = %kind, "Starting watch");

            tokio::spawn(async move {
                let mut stream = watcher(api, watcher::Config::default())
                    .default_backoff()
                    .boxed();
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(watcher::Event::Applied(obj))) => {
                            let _ = tx.send(WatchEvent::Applied(with_types(obj, &resource)));
                        }
                        Some(Ok(watcher::Event::Deleted(obj))) => {
                            let _ = tx.send(WatchEvent::Deleted(with_types(obj, &resource)));
                        }
                        Some(Ok(watcher::Event::Restarted(objs))) => {
                            debug!(kind = %kind, count = objs.len(), "Watch restarted");
                            for obj in objs {
                                let _ = tx.send(WatchEvent::Applied(with_types(obj, &resource)));
                            }
                        }
                        Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                        None => break,
                    }
                }
                info!(kind = %kind, "Watch stopped");
            });
        }
        Ok(())
    }
}

/// List items come back without type meta
fn with_types(mut obj: DynamicObject, resource: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(type_meta(resource));
    }
    obj
}

/// Translate API status codes into store outcomes
fn map_kube_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        let (api, resource) = self.api(&key.kind, key.namespace.as_deref())?;
        api.get(&key.name)
            .await
            .map(|o| with_types(o, &resource))
            .map_err(|e| map_kube_error(e, &key.kind, &key.to_string()))
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>> {
        let (api, resource) = self.api(kind, namespace)?;
        let mut params = ListParams::default();
        if !selector.labels.is_empty() {
            params = params.labels(&format_selector(&selector.labels));
        }
        let list = api.list(&params).await?;

        // Field selectors on custom resources are limited server-side
        Ok(list
            .items
            .into_iter()
            .map(|o| with_types(o, &resource))
            .filter(|o| selector.matches(o))
            .collect())
    }

    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        let (api, resource) = self.api(&key.kind, key.namespace.as_deref())?;
        api.create(&PostParams::default(), &obj)
            .await
            .map(|o| with_types(o, &resource))
            .map_err(|e| map_kube_error(e, &key.kind, &key.to_string()))
    }

    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        let (api, resource) = self.api(&key.kind, key.namespace.as_deref())?;
        api.replace(&key.name, &PostParams::default(), &obj)
            .await
            .map(|o| with_types(o, &resource))
            .map_err(|e| map_kube_error(e, &key.kind, &key.to_string()))
    }

    async fn update_status(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        let (api, resource) = self.api(&key.kind, key.namespace.as_deref())?;
        let body = serde_json::to_vec(&obj)?;
        api.replace_status(&key.name, &PostParams::default(), body)
            .await
            .map(|o| with_types(o, &resource))
            .map_err(|e| map_kube_error(e, &key.kind, &key.to_string()))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let (api, _) = self.api(&key.kind, key.namespace.as_deref())?;
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, &key.kind, &key.to_string()))
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }
}

#[async_trait]
impl EventSink for KubeStore {
    async fn record(&self, event: StoredEvent) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), event.regarding.clone());
        recorder
            .publish(Event {
                type_: match event.severity {
                    EventSeverity::Normal => EventType::Normal,
                    EventSeverity::Warning => EventType::Warning,
                },
                reason: event.reason,
                note: Some(event.message),
                action: "Relay".into(),
                secondary: None,
            })
            .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>> {
        let api: Api<K8sEvent> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|e| {
                let timestamp = e
                    .event_time
                    .as_ref()
                    .map(|t| t.0)
                    .or_else(|| e.metadata.creation_timestamp.as_ref().map(|t| t.0))?;
                Some(StoredEvent {
                    regarding: e.regarding.unwrap_or_default(),
                    severity: match e.type_.as_deref() {
                        Some("Warning") => EventSeverity::Warning,
                        _ => EventSeverity::Normal,
                    },
                    reason: e.reason.unwrap_or_default(),
                    message: e.note.unwrap_or_default(),
                    timestamp,
                })
            })
            .filter(|e| in_window(e.timestamp, from, to))
            .collect())
    }
}

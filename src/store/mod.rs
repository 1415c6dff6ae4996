//! Resource Store port
//!
//! Every component reads and writes objects through [`ResourceStore`]:
//! keyed get/list, create, version-checked update, delete, and a watch
//! stream. Objects cross the port as [`DynamicObject`]s; the explicit
//! [`Registry`] converts them to and from typed CRDs.
//!
//! Two adapters implement the port:
//! - [`MemoryStore`]: in-process store with owner-reference cascade,
//!   finalizers, optimistic concurrency and event recording
//! - [`KubeStore`]: a live cluster through `kube::Api<DynamicObject>`

pub mod kube;
pub mod memory;
pub mod registry;
pub mod selector;
pub mod typed;

pub use self::kube::*;
pub use memory::*;
pub use registry::*;
pub use selector::*;
pub use typed::*;

use crate::domain::ports::EventSeverity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use ::kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

// =============================================================================
// Object Key
// =============================================================================

/// Identity of a stored object: kind plus namespace/name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Derive the key of a dynamic object
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .ok_or_else(|| Error::ApiValidation("object has no kind".into()))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::ApiValidation(format!("{} object has no name", kind)))?;
        Ok(Self {
            kind,
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    /// Not-found error for this key
    pub fn not_found(&self) -> Error {
        Error::not_found(&self.kind, self.to_string())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Watch Events
// =============================================================================

/// Change notification from the store
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object was created or updated
    Applied(DynamicObject),
    /// Object was removed
    Deleted(DynamicObject),
}

impl WatchEvent {
    /// The object this event is about
    pub fn object(&self) -> &DynamicObject {
        match self {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// Kind of the object, if known
    pub fn kind(&self) -> Option<&str> {
        self.object().types.as_ref().map(|t| t.kind.as_str())
    }
}

// =============================================================================
// Store Port
// =============================================================================

/// Port for the declarative resource store
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get one object
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject>;

    /// List objects of a kind, optionally restricted to a namespace
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object; fails with `ResourceExists` if the key is taken
    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace metadata and spec, guarded by the object's resource version.
    /// The stored status is left untouched.
    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace only the status, guarded by the object's resource version
    async fn update_status(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Delete an object. Objects with finalizers are only marked for deletion;
    /// dependents are garbage-collected through owner references.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

pub type ResourceStoreRef = Arc<dyn ResourceStore>;

// =============================================================================
// Event Sink Port
// =============================================================================

/// An event recorded against a store object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Object the event is about
    pub regarding: ObjectReference,
    /// Severity
    pub severity: EventSeverity,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
}

/// Port for recording and listing store events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event against an object
    async fn record(&self, event: StoredEvent) -> Result<()>;

    /// List events whose timestamp falls in `[from, to)`
    async fn list_events(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>>;
}

pub type EventSinkRef = Arc<dyn EventSink>;

/// Record an event now; failures are logged and otherwise ignored
pub async fn emit_event(
    sink: &dyn EventSink,
    regarding: ObjectReference,
    severity: EventSeverity,
    reason: &str,
    message: impl Into<String>,
) {
    let event = StoredEvent {
        regarding,
        severity,
        reason: reason.to_string(),
        message: message.into(),
        timestamp: Utc::now(),
    };
    if let Err(e) = sink.record(event).await {
        warn!(reason, error = %e, "Failed to record event");
    }
}

/// Check if a timestamp falls in the half-open window `[from, to)`
pub fn in_window(ts: DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map(|f| ts >= f).unwrap_or(true) && to.map(|t| ts < t).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_object_key_display() {
        assert_eq!(
            ObjectKey::namespaced("Volume", "default", "vol-1").to_string(),
            "default/vol-1"
        );
        assert_eq!(ObjectKey::cluster("ResourcePool", "pool-a").to_string(), "pool-a");
    }

    #[test]
    fn test_window_is_half_open() {
        let now = Utc::now();
        let later = now + Duration::seconds(10);
        assert!(in_window(now, Some(now), Some(later)));
        assert!(!in_window(later, Some(now), Some(later)));
        assert!(in_window(later, None, None));
    }
}

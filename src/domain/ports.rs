//! Domain Ports - Runtime protocol types and trait definitions
//!
//! The [`Runtime`] port is the narrow contract between the pool-side
//! controllers and a backend: create, list, delete and expand objects of one
//! resource kind, report per-class capacity, and list events in a time window.
//! The broker implements it as a server; the poollet consumes it as a client.

use crate::crd::{Capabilities, ResourceKind, ResourceList};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Classes
// =============================================================================

/// A class as reported by a runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    /// Class name, unique within one runtime
    pub name: String,
    /// Capability values
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
        }
    }
}

/// One row of a runtime status response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatus {
    /// The class and its capabilities
    pub class: ClassInfo,
    /// Aggregate quantity across the targeted pools
    pub quantity: i64,
}

// =============================================================================
// Runtime Objects
// =============================================================================

/// Metadata of a runtime object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMetadata {
    /// Identifier assigned by the runtime on create
    #[serde(default)]
    pub id: String,
    /// Caller labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Caller annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Desired state of a runtime object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Logical class name
    pub class: String,
    /// Capabilities the caller expects the class to have
    #[serde(default)]
    pub class_capabilities: Capabilities,
    /// Requested resources
    #[serde(default)]
    pub resources: ResourceList,
    /// Boot image (workloads only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Secret payload stored alongside the object (encryption key, ignition, credentials)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_data: Option<BTreeMap<String, String>>,
}

/// Observed runtime state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeState {
    #[default]
    Pending,
    Available,
    Error,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Pending => write!(f, "Pending"),
            RuntimeState::Available => write!(f, "Available"),
            RuntimeState::Error => write!(f, "Error"),
        }
    }
}

/// Access or connection data for an available object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessInfo {
    #[serde(default)]
    pub secret_data: BTreeMap<String, String>,
}

/// Observed state of a runtime object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    #[serde(default)]
    pub state: RuntimeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessInfo>,
}

/// An object as seen through the runtime protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeObject {
    #[serde(default)]
    pub metadata: RuntimeMetadata,
    pub spec: RuntimeSpec,
    #[serde(default)]
    pub status: RuntimeStatus,
}

// =============================================================================
// Filters
// =============================================================================

/// Filter for `list`: exact id, label selector, or neither
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
}

impl ListFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            label_selector: BTreeMap::new(),
        }
    }

    pub fn by_labels(label_selector: BTreeMap<String, String>) -> Self {
        Self {
            id: None,
            label_selector,
        }
    }
}

/// Pools a status query targets: explicit names, or a label selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolTarget {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

/// Filter for `list_events`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    /// Inclusive lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

// =============================================================================
// Events
// =============================================================================

/// Event severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    #[default]
    Normal,
    Warning,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Normal => write!(f, "Normal"),
            EventSeverity::Warning => write!(f, "Warning"),
        }
    }
}

/// An event reported by a runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvent {
    /// Labels of the involved object
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
    pub event_time: DateTime<Utc>,
}

// =============================================================================
// Ports
// =============================================================================

/// Port for a backend runtime serving one resource kind
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Kind of objects this runtime serves
    fn kind(&self) -> ResourceKind;

    /// Create an object; the returned object carries the generated id
    async fn create(&self, object: RuntimeObject) -> Result<RuntimeObject>;

    /// List objects matching the filter
    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeObject>>;

    /// Delete an object; `ResourceNotFound` if it does not exist
    async fn delete(&self, id: &str) -> Result<()>;

    /// Replace the resources of an existing object
    async fn update_resources(&self, id: &str, resources: ResourceList) -> Result<()>;

    /// Per-class capacity of the targeted pools
    async fn status(&self, target: &PoolTarget) -> Result<Vec<ClassStatus>>;

    /// Every class this runtime can provision, with or without capacity
    async fn list_classes(&self) -> Result<Vec<ClassInfo>>;

    /// Events in the filter's time window
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<RuntimeEvent>>;
}

pub type RuntimeRef = Arc<dyn Runtime>;

/// Port for anything that can enumerate classes
#[async_trait]
pub trait ClassSource: Send + Sync {
    async fn list_classes(&self) -> Result<Vec<ClassInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_object_json_shape() {
        let obj = RuntimeObject {
            metadata: RuntimeMetadata {
                id: "abc".into(),
                ..Default::default()
            },
            spec: RuntimeSpec {
                class: "fast".into(),
                resources: [("storage".to_string(), 100)].into_iter().collect(),
                ..Default::default()
            },
            status: RuntimeStatus::default(),
        };
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["metadata"]["id"], "abc");
        assert_eq!(json["spec"]["resources"]["storage"], 100);
        assert_eq!(json["status"]["state"], "Pending");
        assert!(json["spec"].get("image").is_none());
    }

    #[test]
    fn test_list_filter_constructors() {
        assert_eq!(ListFilter::by_id("x").id.as_deref(), Some("x"));
        assert!(ListFilter::by_labels(BTreeMap::new()).id.is_none());
    }
}

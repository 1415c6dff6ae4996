//! ResourcePool CRD
//!
//! Represents one backend runtime instance: its labels, taints, the classes
//! it currently offers and the allocatable quantity per class.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Taint;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::class::{Capabilities, ResourceKind};

// =============================================================================
// ResourcePool CRD
// =============================================================================

/// ResourcePool is one backend runtime that requests of a single kind can be
/// scheduled onto.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pool-broker.io",
    version = "v1alpha1",
    kind = "ResourcePool",
    plural = "resourcepools",
    shortname = "rp",
    status = "ResourcePoolStatus",
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.kind"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePoolSpec {
    /// Kind of resource this pool provisions
    pub kind: ResourceKind,

    /// Identifier of the backing runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Taints that requests must tolerate to land on this pool
    #[serde(default)]
    pub taints: Vec<Taint>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the ResourcePool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePoolStatus {
    /// Current phase
    #[serde(default)]
    pub phase: PoolPhase,

    /// Classes the runtime currently reports, replaced wholesale on refresh
    #[serde(default)]
    pub available_classes: Vec<AvailableClass>,

    /// Allocatable quantity per class name
    #[serde(default)]
    pub allocatable: BTreeMap<String, i64>,

    /// Last time the classes were synced from the runtime
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<PoolCondition>,
}

/// A class offered by a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AvailableClass {
    /// Class name
    pub name: String,

    /// Capabilities of the class
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Pool lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PoolPhase {
    #[default]
    Pending,
    Ready,
    Unavailable,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPhase::Pending => write!(f, "Pending"),
            PoolPhase::Ready => write!(f, "Ready"),
            PoolPhase::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// Pool condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: String,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl ResourcePool {
    /// Get the pool name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Check if the pool is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Labels of the pool
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    /// Check if the pool advertises a class with this name
    pub fn offers_class(&self, class: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| s.available_classes.iter().any(|c| c.name == class))
            .unwrap_or(false)
    }

    /// Allocatable quantity reported for a class, if any
    pub fn allocatable(&self, class: &str) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|s| s.allocatable.get(class).copied())
    }
}

impl ResourcePoolStatus {
    /// Set a condition
    pub fn set_condition(&mut self, condition: PoolCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_classes(classes: &[&str]) -> ResourcePool {
        let mut pool = ResourcePool::new(
            "pool-a",
            ResourcePoolSpec {
                kind: ResourceKind::Volume,
                provider_id: None,
                taints: vec![],
            },
        );
        pool.status = Some(ResourcePoolStatus {
            available_classes: classes
                .iter()
                .map(|c| AvailableClass {
                    name: c.to_string(),
                    capabilities: Capabilities::new(),
                })
                .collect(),
            ..Default::default()
        });
        pool
    }

    #[test]
    fn test_offers_class() {
        let pool = pool_with_classes(&["fast", "slow"]);
        assert!(pool.offers_class("fast"));
        assert!(!pool.offers_class("medium"));
        assert!(!pool.is_deleting());
    }

    #[test]
    fn test_pool_without_status_offers_nothing() {
        let mut pool = pool_with_classes(&[]);
        pool.status = None;
        assert!(!pool.offers_class("fast"));
        assert_eq!(pool.allocatable("fast"), None);
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut status = ResourcePoolStatus::default();
        let cond = |s: &str| PoolCondition {
            r#type: "Synced".into(),
            status: s.into(),
            last_transition_time: None,
            reason: None,
            message: None,
        };
        status.set_condition(cond("False"));
        status.set_condition(cond("True"));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "True");
    }
}

//! Pool-scoped request CRDs
//!
//! Workload, Volume and Bucket share one spec/status shape: a class
//! reference, resources, pool placement hints and tolerations. The
//! [`PoolResource`] trait lets the scheduler, broker and poollet treat the
//! three kinds uniformly.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Toleration;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::class::ResourceKind;
use crate::store::StoreObject;

/// Resource name to quantity (e.g. `storage`, `cpu`)
pub type ResourceList = BTreeMap<String, i64>;

// =============================================================================
// Common Spec
// =============================================================================

/// Fields every pool-scoped request carries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolResourceSpec {
    /// Logical class name
    pub class_ref: String,

    /// Pool the request is placed on; set by the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_ref: Option<String>,

    /// Label selector for eligible pools (empty matches all)
    #[serde(default)]
    pub pool_selector: BTreeMap<String, String>,

    /// Tolerations for pool taints
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Requested resources
    #[serde(default)]
    pub resources: ResourceList,

    /// Secret holding encryption (volume), ignition (workload) or access data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

// =============================================================================
// Common Status
// =============================================================================

/// Status shared by every pool-scoped request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolResourceStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ResourcePhase,

    /// Identifier of the object on the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Secret holding access/connection data once available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_secret_ref: Option<String>,

    /// Resources last applied to the runtime
    #[serde(default)]
    pub applied_resources: ResourceList,

    /// Human-readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last status update
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Request lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ResourcePhase {
    #[default]
    Unscheduled,
    Pending,
    Provisioning,
    Available,
    Error,
}

impl std::fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourcePhase::Unscheduled => write!(f, "Unscheduled"),
            ResourcePhase::Pending => write!(f, "Pending"),
            ResourcePhase::Provisioning => write!(f, "Provisioning"),
            ResourcePhase::Available => write!(f, "Available"),
            ResourcePhase::Error => write!(f, "Error"),
        }
    }
}

/// Where a request stands from the scheduler's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingState {
    Unscheduled,
    Pending,
    Scheduled,
}

// =============================================================================
// Volume CRD
// =============================================================================

/// Volume is a block volume request.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pool-broker.io",
    version = "v1alpha1",
    kind = "Volume",
    plural = "volumes",
    shortname = "vol",
    status = "PoolResourceStatus",
    namespaced,
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.classRef"}"#,
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.poolRef"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    #[serde(flatten)]
    pub common: PoolResourceSpec,
}

// =============================================================================
// Bucket CRD
// =============================================================================

/// Bucket is an object bucket request.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pool-broker.io",
    version = "v1alpha1",
    kind = "Bucket",
    plural = "buckets",
    status = "PoolResourceStatus",
    namespaced,
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.classRef"}"#,
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.poolRef"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    #[serde(flatten)]
    pub common: PoolResourceSpec,
}

// =============================================================================
// Workload CRD
// =============================================================================

/// Workload is a compute workload request.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pool-broker.io",
    version = "v1alpha1",
    kind = "Workload",
    plural = "workloads",
    shortname = "wl",
    status = "PoolResourceStatus",
    namespaced,
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.classRef"}"#,
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.poolRef"}"#,
    printcolumn = r#"{"name": "Image", "type": "string", "jsonPath": ".spec.image"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(flatten)]
    pub common: PoolResourceSpec,

    /// Boot image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

// =============================================================================
// PoolResource Trait
// =============================================================================

/// Uniform access to the three pool-scoped request kinds
pub trait PoolResource: StoreObject {
    /// Kind discriminator
    const RESOURCE_KIND: ResourceKind;

    /// Build a new object with the given name and common spec
    fn build(name: &str, common: PoolResourceSpec) -> Self;

    fn common(&self) -> &PoolResourceSpec;

    fn common_mut(&mut self) -> &mut PoolResourceSpec;

    fn resource_status(&self) -> Option<&PoolResourceStatus>;

    /// Status, created with defaults if absent
    fn resource_status_mut(&mut self) -> &mut PoolResourceStatus;

    /// Kind-specific boot image (workloads only)
    fn image(&self) -> Option<&str> {
        None
    }

    fn set_image(&mut self, _image: Option<String>) {}

    /// Object name
    fn object_name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or("unknown")
    }

    /// Check if the object is being deleted
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Current phase, `Unscheduled` if no status yet
    fn phase(&self) -> ResourcePhase {
        self.resource_status()
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Scheduling state derived from the pool reference and phase
    fn scheduling_state(&self) -> SchedulingState {
        if self.common().pool_ref.is_some() {
            SchedulingState::Scheduled
        } else if self.phase() == ResourcePhase::Pending {
            SchedulingState::Pending
        } else {
            SchedulingState::Unscheduled
        }
    }
}

impl PoolResource for Volume {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Volume;

    fn build(name: &str, common: PoolResourceSpec) -> Self {
        Volume::new(name, VolumeSpec { common })
    }

    fn common(&self) -> &PoolResourceSpec {
        &self.spec.common
    }

    fn common_mut(&mut self) -> &mut PoolResourceSpec {
        &mut self.spec.common
    }

    fn resource_status(&self) -> Option<&PoolResourceStatus> {
        self.status.as_ref()
    }

    fn resource_status_mut(&mut self) -> &mut PoolResourceStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl PoolResource for Bucket {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Bucket;

    fn build(name: &str, common: PoolResourceSpec) -> Self {
        Bucket::new(name, BucketSpec { common })
    }

    fn common(&self) -> &PoolResourceSpec {
        &self.spec.common
    }

    fn common_mut(&mut self) -> &mut PoolResourceSpec {
        &mut self.spec.common
    }

    fn resource_status(&self) -> Option<&PoolResourceStatus> {
        self.status.as_ref()
    }

    fn resource_status_mut(&mut self) -> &mut PoolResourceStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl PoolResource for Workload {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Workload;

    fn build(name: &str, common: PoolResourceSpec) -> Self {
        Workload::new(
            name,
            WorkloadSpec {
                common,
                image: None,
            },
        )
    }

    fn common(&self) -> &PoolResourceSpec {
        &self.spec.common
    }

    fn common_mut(&mut self) -> &mut PoolResourceSpec {
        &mut self.spec.common
    }

    fn resource_status(&self) -> Option<&PoolResourceStatus> {
        self.status.as_ref()
    }

    fn resource_status_mut(&mut self) -> &mut PoolResourceStatus {
        self.status.get_or_insert_with(Default::default)
    }

    fn image(&self) -> Option<&str> {
        self.spec.image.as_deref()
    }

    fn set_image(&mut self, image: Option<String>) {
        self.spec.image = image;
    }
}

//! Backend object metadata and protocol conversion
//!
//! Runtime-facing labels and annotations are not applied to backend objects
//! directly. They travel as JSON snapshots in two annotations, so backend
//! label semantics never leak into what the caller sees.

use crate::crd::{PoolResource, ResourcePhase};
use crate::domain::ports::{AccessInfo, RuntimeMetadata, RuntimeObject, RuntimeSpec, RuntimeState, RuntimeStatus};
use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Label naming the broker that manages an object
pub const MANAGER_LABEL: &str = "pool-broker.io/manager";

/// Annotation set once every create step has succeeded
pub const CREATED_ANNOTATION: &str = "pool-broker.io/created";

/// Snapshot of the caller's labels
pub const LABELS_ANNOTATION: &str = "pool-broker.io/labels";

/// Snapshot of the caller's annotations
pub const ANNOTATIONS_ANNOTATION: &str = "pool-broker.io/annotations";

/// Caller labels and annotations carried on a backend object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSnapshot {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl LabelSnapshot {
    pub fn new(labels: BTreeMap<String, String>, annotations: BTreeMap<String, String>) -> Self {
        Self { labels, annotations }
    }

    /// Write both snapshots into the object's annotations
    pub fn encode_into(&self, meta: &mut ObjectMeta) -> Result<()> {
        let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(LABELS_ANNOTATION.into(), serde_json::to_string(&self.labels)?);
        annotations.insert(
            ANNOTATIONS_ANNOTATION.into(),
            serde_json::to_string(&self.annotations)?,
        );
        Ok(())
    }

    /// Read both snapshots back; a missing annotation is an empty map
    pub fn decode_from(meta: &ObjectMeta) -> Result<Self> {
        let read = |key: &str| -> Result<BTreeMap<String, String>> {
            match meta.annotations.as_ref().and_then(|a| a.get(key)) {
                None => Ok(BTreeMap::new()),
                Some(raw) => serde_json::from_str(raw).map_err(|e| {
                    Error::Internal(format!(
                        "corrupt {} annotation on {}: {}",
                        key,
                        meta.name.as_deref().unwrap_or("unknown"),
                        e
                    ))
                }),
            }
        };
        Ok(Self {
            labels: read(LABELS_ANNOTATION)?,
            annotations: read(ANNOTATIONS_ANNOTATION)?,
        })
    }
}

/// Whether the object is managed by `manager` and fully created
pub fn is_owned_and_created(meta: &ObjectMeta, manager: &str) -> bool {
    is_managed_by(meta, manager)
        && meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(CREATED_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false)
}

/// Whether the object carries `manager`'s label
pub fn is_managed_by(meta: &ObjectMeta, manager: &str) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(MANAGER_LABEL))
        .map(|v| v == manager)
        .unwrap_or(false)
}

/// Runtime state derived from the backend phase
pub fn runtime_state(phase: ResourcePhase) -> RuntimeState {
    match phase {
        ResourcePhase::Available => RuntimeState::Available,
        ResourcePhase::Error => RuntimeState::Error,
        ResourcePhase::Unscheduled | ResourcePhase::Pending | ResourcePhase::Provisioning => {
            RuntimeState::Pending
        }
    }
}

/// Build the protocol view of a backend object
pub fn to_runtime_object<K: PoolResource>(obj: &K, access: Option<AccessInfo>) -> Result<RuntimeObject> {
    let meta = obj.meta();
    let snapshot = LabelSnapshot::decode_from(meta)?;
    let common = obj.common();

    Ok(RuntimeObject {
        metadata: RuntimeMetadata {
            id: obj.object_name().to_string(),
            labels: snapshot.labels,
            annotations: snapshot.annotations,
            created_at: meta.creation_timestamp.as_ref().map(|t| t.0),
        },
        spec: RuntimeSpec {
            class: common.class_ref.clone(),
            class_capabilities: BTreeMap::new(),
            resources: common.resources.clone(),
            image: obj.image().map(String::from),
            secret_data: None,
        },
        status: RuntimeStatus {
            state: runtime_state(obj.phase()),
            access,
        },
    })
}

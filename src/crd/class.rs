//! ResourceClass CRD
//!
//! A named capability bundle (throughput and IOPS for storage, CPU and
//! memory for compute) that requests reference by name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capability name to value
pub type Capabilities = BTreeMap<String, i64>;

// =============================================================================
// Resource Kind
// =============================================================================

/// The resource kinds a pool can provision
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Workload,
    Volume,
    Bucket,
}

impl ResourceKind {
    /// All kinds, in a stable order
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Workload,
        ResourceKind::Volume,
        ResourceKind::Bucket,
    ];

    /// Capability names that make up a class signature for this kind, in order
    pub fn capability_names(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Workload => &["cpu", "memory"],
            ResourceKind::Volume | ResourceKind::Bucket => &["tps", "iops"],
        }
    }

    /// Lowercase plural used in URLs
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Workload => "workloads",
            ResourceKind::Volume => "volumes",
            ResourceKind::Bucket => "buckets",
        }
    }

    /// What the secondary secret of an aggregate carries for this kind
    pub fn secret_purpose(&self) -> &'static str {
        match self {
            ResourceKind::Workload => "ignition",
            ResourceKind::Volume => "encryption",
            ResourceKind::Bucket => "access",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Workload => write!(f, "workload"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Bucket => write!(f, "bucket"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().trim_end_matches('s') {
            "workload" | "machine" => Ok(ResourceKind::Workload),
            "volume" => Ok(ResourceKind::Volume),
            "bucket" => Ok(ResourceKind::Bucket),
            _ => Err(crate::error::Error::Configuration(format!(
                "unknown resource kind: {}. Use 'workload', 'volume', or 'bucket'",
                s
            ))),
        }
    }
}

// =============================================================================
// ResourceClass CRD
// =============================================================================

/// ResourceClass names a capability bundle for one resource kind.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pool-broker.io",
    version = "v1alpha1",
    kind = "ResourceClass",
    plural = "resourceclasses",
    shortname = "rcl",
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.kind"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClassSpec {
    /// Kind of resource this class applies to
    pub kind: ResourceKind,

    /// Capability values (e.g. tps/iops or cpu/memory)
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ResourceClass {
    /// Get the class name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_and_display() {
        assert_eq!("volume".parse::<ResourceKind>().unwrap(), ResourceKind::Volume);
        assert_eq!("Buckets".parse::<ResourceKind>().unwrap(), ResourceKind::Bucket);
        assert_eq!("machine".parse::<ResourceKind>().unwrap(), ResourceKind::Workload);
        assert!("disk".parse::<ResourceKind>().is_err());
        assert_eq!(format!("{}", ResourceKind::Workload), "workload");
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(ResourceKind::Volume.capability_names(), &["tps", "iops"]);
        assert_eq!(ResourceKind::Workload.capability_names(), &["cpu", "memory"]);
    }
}

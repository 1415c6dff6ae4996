use crate::crd::{Capabilities, ResourceKind};
use std::fmt;

/// Ordered capability values relevant to a resource kind.
///
/// Names are not part of the signature, so differently named classes with
/// identical values share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilitySignature(Vec<i64>);

impl CapabilitySignature {
    /// Signature of `capabilities` for `kind`; missing capabilities count as zero
    pub fn for_kind(kind: ResourceKind, capabilities: &Capabilities) -> Self {
        Self(
            kind.capability_names()
                .iter()
                .map(|name| capabilities.get(*name).copied().unwrap_or(0))
                .collect(),
        )
    }

    pub fn values(&self) -> &[i64] {
        &self.0
    }
}

impl fmt::Display for CapabilitySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(i64::to_string).collect();
        write!(f, "({})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(pairs: &[(&str, i64)]) -> Capabilities {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_signature_ignores_unrelated_and_defaults_missing() {
        let sig = CapabilitySignature::for_kind(
            ResourceKind::Volume,
            &caps(&[("iops", 500), ("tps", 100), ("color", 3)]),
        );
        assert_eq!(sig.values(), &[100, 500]);

        let sig = CapabilitySignature::for_kind(ResourceKind::Workload, &caps(&[("cpu", 4)]));
        assert_eq!(sig.values(), &[4, 0]);
        assert_eq!(sig.to_string(), "(4, 0)");
    }
}

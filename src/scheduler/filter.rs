//! Pool filter pipeline
//!
//! Candidates are pools of the request's kind that are not being deleted,
//! advertise the requested class, and match the pool selector. Tolerations
//! are applied as a second stage so "no pool for class" and "no tolerated
//! pool" stay distinguishable.

use crate::crd::{PoolResourceSpec, ResourceKind, ResourcePool};
use crate::store::labels_match;
use k8s_openapi::api::core::v1::{Taint, Toleration};

/// Whether `toleration` matches `taint`.
///
/// An empty effect matches every effect and an empty key matches every key.
/// `Exists` ignores the value; `Equal` (or no operator) compares it.
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = non_empty(&toleration.effect) {
        if effect != taint.effect {
            return false;
        }
    }
    if let Some(key) = non_empty(&toleration.key) {
        if key != taint.key {
            return false;
        }
    }

    match toleration.operator.as_deref() {
        Some("Exists") => true,
        None | Some("") | Some("Equal") => {
            toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or("")
        }
        Some(_) => false,
    }
}

/// Every taint has at least one matching toleration
pub fn tolerates_all(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .all(|taint| tolerations.iter().any(|t| tolerates(t, taint)))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Pools that could host the request, ignoring taints
pub fn candidate_pools<'a>(
    pools: &'a [ResourcePool],
    kind: ResourceKind,
    request: &PoolResourceSpec,
) -> Vec<&'a ResourcePool> {
    pools
        .iter()
        .filter(|pool| is_candidate(pool, kind, request))
        .collect()
}

/// Candidates whose taints the request tolerates
pub fn tolerated_pools<'a>(
    candidates: &[&'a ResourcePool],
    tolerations: &[Toleration],
) -> Vec<&'a ResourcePool> {
    candidates
        .iter()
        .copied()
        .filter(|pool| tolerates_all(tolerations, &pool.spec.taints))
        .collect()
}

/// Kind, deletion, class and selector checks for one pool
pub fn is_candidate(pool: &ResourcePool, kind: ResourceKind, request: &PoolResourceSpec) -> bool {
    pool.spec.kind == kind
        && !pool.is_deleting()
        && pool.offers_class(&request.class_ref)
        && labels_match(&request.pool_selector, &pool.labels())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AvailableClass, ResourcePoolSpec, ResourcePoolStatus};
    use std::collections::BTreeMap;

    fn taint(key: &str, value: Option<&str>, effect: &str) -> Taint {
        Taint {
            key: key.into(),
            value: value.map(String::from),
            effect: effect.into(),
            time_added: None,
        }
    }

    fn toleration(key: Option<&str>, operator: Option<&str>, value: Option<&str>, effect: Option<&str>) -> Toleration {
        Toleration {
            key: key.map(String::from),
            operator: operator.map(String::from),
            value: value.map(String::from),
            effect: effect.map(String::from),
            toleration_seconds: None,
        }
    }

    pub(crate) fn pool(name: &str, classes: &[&str], labels: &[(&str, &str)], taints: Vec<Taint>) -> ResourcePool {
        let mut pool = ResourcePool::new(
            name,
            ResourcePoolSpec {
                kind: ResourceKind::Volume,
                provider_id: None,
                taints,
            },
        );
        pool.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pool.status = Some(ResourcePoolStatus {
            available_classes: classes
                .iter()
                .map(|c| AvailableClass {
                    name: c.to_string(),
                    capabilities: BTreeMap::new(),
                })
                .collect(),
            ..Default::default()
        });
        pool
    }

    #[test]
    fn test_tolerates_semantics() {
        let t = taint("dedicated", Some("gpu"), "NoSchedule");

        assert!(tolerates(&toleration(Some("dedicated"), Some("Equal"), Some("gpu"), Some("NoSchedule")), &t));
        assert!(tolerates(&toleration(Some("dedicated"), None, Some("gpu"), None), &t));
        assert!(!tolerates(&toleration(Some("dedicated"), Some("Equal"), Some("cpu"), None), &t));
        assert!(tolerates(&toleration(Some("dedicated"), Some("Exists"), None, None), &t));
        assert!(!tolerates(&toleration(Some("dedicated"), Some("Exists"), None, Some("NoExecute")), &t));
        assert!(!tolerates(&toleration(Some("other"), Some("Exists"), None, None), &t));
        // Empty key with Exists tolerates everything
        assert!(tolerates(&toleration(None, Some("Exists"), None, None), &t));
        assert!(!tolerates(&toleration(Some("dedicated"), Some("Lt"), Some("gpu"), None), &t));
    }

    #[test]
    fn test_exists_matches_key_only_taint() {
        let key_only = taint("maintenance", None, "NoSchedule");
        assert!(tolerates(&toleration(Some("maintenance"), Some("Exists"), None, None), &key_only));
        assert!(tolerates(&toleration(Some("maintenance"), Some("Equal"), None, None), &key_only));
        assert!(!tolerates(&toleration(Some("maintenance"), Some("Equal"), Some("x"), None), &key_only));
    }

    #[test]
    fn test_untolerated_taint_never_passes() {
        let keys = ["a", "b"];
        let values = [None, Some("1"), Some("2")];
        let effects = ["NoSchedule", "NoExecute"];
        let operators = [None, Some("Equal"), Some("Exists")];

        for key in keys {
            for value in values {
                for effect in effects {
                    let t = taint(key, value, effect);
                    for tol_key in [None, Some("a"), Some("b")] {
                        for op in operators {
                            for tol_value in values {
                                for tol_effect in [None, Some("NoSchedule"), Some("NoExecute")] {
                                    let tol = toleration(tol_key, op, tol_value, tol_effect);
                                    let expected = tol_effect.map(|e| e == effect).unwrap_or(true)
                                        && tol_key.map(|k| k == key).unwrap_or(true)
                                        && (op == Some("Exists")
                                            || tol_value.unwrap_or("") == value.unwrap_or(""));
                                    assert_eq!(tolerates(&tol, &t), expected, "{:?} vs {:?}", tol, t);
                                    assert_eq!(tolerates_all(&[tol], &[t.clone()]), expected);
                                }
                            }
                        }
                    }
                }
            }
        }
        // A second taint without a toleration excludes the pool
        let taints = vec![taint("a", None, "NoSchedule"), taint("b", None, "NoSchedule")];
        let tols = vec![toleration(Some("a"), Some("Exists"), None, None)];
        assert!(!tolerates_all(&tols, &taints));
        assert!(tolerates_all(&tols, &[]));
    }

    #[test]
    fn test_candidate_pipeline() {
        let mut deleting = pool("deleting", &["fast"], &[], vec![]);
        deleting.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        let mut bucket_pool = pool("bucket", &["fast"], &[], vec![]);
        bucket_pool.spec.kind = ResourceKind::Bucket;

        let pools = vec![
            pool("a", &["fast"], &[("zone", "1")], vec![]),
            pool("b", &["fast"], &[("zone", "2")], vec![taint("gpu", None, "NoSchedule")]),
            pool("c", &["slow"], &[("zone", "1")], vec![]),
            deleting,
            bucket_pool,
        ];

        let mut request = PoolResourceSpec {
            class_ref: "fast".into(),
            ..Default::default()
        };
        let names = |v: Vec<&ResourcePool>| v.iter().map(|p| p.name().to_string()).collect::<Vec<_>>();

        let candidates = candidate_pools(&pools, ResourceKind::Volume, &request);
        assert_eq!(names(candidates.clone()), vec!["a", "b"]);
        assert_eq!(names(tolerated_pools(&candidates, &request.tolerations)), vec!["a"]);

        request.pool_selector.insert("zone".into(), "2".into());
        let candidates = candidate_pools(&pools, ResourceKind::Volume, &request);
        assert_eq!(names(candidates.clone()), vec!["b"]);
        assert!(tolerated_pools(&candidates, &request.tolerations).is_empty());

        request.tolerations.push(toleration(Some("gpu"), Some("Exists"), None, None));
        assert_eq!(names(tolerated_pools(&candidates, &request.tolerations)), vec!["b"]);
    }
}

//! Label and field selectors
//!
//! Selectors use the `key=value,key2=value2` equality form. Field selectors
//! address object fields by dotted path (`metadata.name`, `spec.poolRef`);
//! an unset field compares equal to the empty string.

use crate::error::{Error, Result};
use kube::core::DynamicObject;
use std::collections::BTreeMap;

/// Parse `k=v,k2=v2` into a map. An empty string yields an empty map.
pub fn parse_selector(input: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for term in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term
            .split_once("==")
            .or_else(|| term.split_once('='))
            .ok_or_else(|| Error::SelectorParse(format!("expected key=value, got '{}'", term)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::SelectorParse(format!("empty key in '{}'", term)));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// Format a map as `k=v,k2=v2`
pub fn format_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Check that every selector entry is present in `labels` with the same value
pub fn labels_match(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
}

/// Label plus field selector for store lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

impl ListSelector {
    /// Selector matching everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Selector on labels only
    pub fn labels(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            fields: BTreeMap::new(),
        }
    }

    /// Add a label requirement
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a field requirement
    pub fn with_field(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(path.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.fields.is_empty()
    }

    /// Check whether an object satisfies both selectors
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        let empty = BTreeMap::new();
        let labels = obj.metadata.labels.as_ref().unwrap_or(&empty);
        if !labels_match(&self.labels, labels) {
            return false;
        }
        if self.fields.is_empty() {
            return true;
        }

        let value = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(_) => return false,
        };
        self.fields
            .iter()
            .all(|(path, expected)| field_value(&value, path) == *expected)
    }
}

/// Resolve a dotted path to its string form
fn field_value(root: &serde_json::Value, path: &str) -> String {
    let pointer = format!("/{}", path.replace('.', "/"));
    match root.pointer(&pointer) {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn object(labels: &[(&str, &str)], pool_ref: Option<&str>) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("pool-broker.io", "v1alpha1", "Volume"));
        let mut obj = DynamicObject::new("vol-1", &ar).within("default");
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        obj.data = match pool_ref {
            Some(p) => json!({"spec": {"classRef": "fast", "poolRef": p}}),
            None => json!({"spec": {"classRef": "fast"}}),
        };
        obj
    }

    #[test]
    fn test_parse_and_format() {
        let sel = parse_selector("zone=a, tier==gold").unwrap();
        assert_eq!(sel.get("zone").map(String::as_str), Some("a"));
        assert_eq!(sel.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(format_selector(&sel), "tier=gold,zone=a");
        assert!(parse_selector("").unwrap().is_empty());
        assert!(parse_selector("novalue").is_err());
        assert!(parse_selector("=x").is_err());
    }

    #[test]
    fn test_label_match() {
        let obj = object(&[("zone", "a"), ("tier", "gold")], None);
        assert!(ListSelector::all().matches(&obj));
        assert!(ListSelector::all().with_label("zone", "a").matches(&obj));
        assert!(!ListSelector::all().with_label("zone", "b").matches(&obj));
        assert!(!ListSelector::all().with_label("rack", "1").matches(&obj));
    }

    #[test]
    fn test_field_match_unset_is_empty() {
        let placed = object(&[], Some("pool-a"));
        let unplaced = object(&[], None);

        let on_a = ListSelector::all().with_field("spec.poolRef", "pool-a");
        assert!(on_a.matches(&placed));
        assert!(!on_a.matches(&unplaced));

        let unset = ListSelector::all().with_field("spec.poolRef", "");
        assert!(unset.matches(&unplaced));
        assert!(ListSelector::all()
            .with_field("metadata.name", "vol-1")
            .matches(&placed));
    }
}

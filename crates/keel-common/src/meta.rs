//! Kubernetes object metadata shared by every cluster-side declaration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Minimal ObjectMeta with the fields keel sets
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create namespaced metadata with the standard keel labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert(crate::LABEL_NAME.to_string(), name.clone());
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_KEEL.to_string(),
        );
        Self {
            name,
            namespace: Some(namespace.into()),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Create cluster-scoped metadata (PersistentVolume, ...)
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        let mut meta = Self::new(name, "");
        meta.namespace = None;
        meta
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add several labels; later keys override earlier ones
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_standard_labels() {
        let meta = ObjectMeta::new("api", "orders");
        assert_eq!(meta.namespace.as_deref(), Some("orders"));
        assert_eq!(meta.labels.get(crate::LABEL_NAME), Some(&"api".to_string()));
        assert_eq!(
            meta.labels.get(crate::LABEL_MANAGED_BY),
            Some(&"keel".to_string())
        );
    }

    #[test]
    fn cluster_scoped_has_no_namespace() {
        let meta = ObjectMeta::cluster_scoped("debezium-orders-pv");
        assert!(meta.namespace.is_none());
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("namespace").is_none());
    }
}

//! Dynamic providers for resources the managed providers don't cover
//!
//! Local stand-ins (Pub/Sub emulator topics, databases on a local server)
//! are declared with [`Backend::Local`](crate::Backend::Local) and realised by
//! a `DynamicProvider` registered for their kind.

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// Outcome of comparing previously applied inputs with new inputs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Whether anything changed
    pub changes: bool,
    /// Changed fields that cannot be updated in place
    pub replaces: Vec<String>,
}

impl DiffResult {
    /// Whether the resource must be recreated
    pub fn requires_replace(&self) -> bool {
        !self.replaces.is_empty()
    }
}

/// Create/diff/update callbacks for one dynamic resource kind
#[async_trait]
pub trait DynamicProvider: Send + Sync {
    /// Declaration kind this provider realises
    fn kind(&self) -> &'static str;

    /// Create the resource; returns its outputs
    async fn create(&self, inputs: &Value) -> Result<Value>;

    /// Compare applied inputs against new inputs
    async fn diff(&self, old: &Value, new: &Value) -> Result<DiffResult> {
        Ok(diff_inputs(old, new, &[]))
    }

    /// Update the resource in place; returns its outputs
    async fn update(&self, old: &Value, new: &Value) -> Result<Value>;

    /// Recreate the resource after a diff that requires replacement.
    /// Defaults to creating from the new inputs.
    async fn replace(&self, _old: &Value, new: &Value) -> Result<Value> {
        self.create(new).await
    }
}

/// Field-level comparison of two JSON objects.
///
/// Any changed top-level field counts as a change; fields listed in
/// `replace_on` are reported as requiring replacement.
pub fn diff_inputs(old: &Value, new: &Value, replace_on: &[&str]) -> DiffResult {
    let empty = serde_json::Map::new();
    let old_obj = old.as_object().unwrap_or(&empty);
    let new_obj = new.as_object().unwrap_or(&empty);

    let mut changed: Vec<&String> = new_obj
        .iter()
        .filter(|(k, v)| old_obj.get(*k) != Some(*v))
        .map(|(k, _)| k)
        .collect();
    changed.extend(old_obj.keys().filter(|k| !new_obj.contains_key(*k)));

    let replaces = changed
        .iter()
        .filter(|k| replace_on.contains(&k.as_str()))
        .map(|k| k.to_string())
        .collect();

    DiffResult {
        changes: !changed.is_empty(),
        replaces,
    }
}

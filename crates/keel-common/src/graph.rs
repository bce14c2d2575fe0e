//! Resource graph
//!
//! Every constructor in keel registers provider declarations here instead of
//! talking to an API. A declaration is identified by its `ResourceId`, carries
//! the provider object as JSON and lists the declarations it depends on. The
//! orchestration engine consumes the finished graph; keel never diffs or
//! applies managed resources itself.
//!
//! Dependencies must already be registered when a declaration is added, so
//! insertion order is always a valid creation order.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::Backend;
use crate::{Error, Result};

/// Identity of a declaration: type token, logical name and optional target cluster.
///
/// Two declarations with the same identity are rejected, which is what keeps
/// side effects from being declared twice across replicated clusters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Provider type token (e.g. `kubernetes:apps/v1:Deployment`)
    pub kind: String,
    /// Logical name, unique per kind and target
    pub name: String,
    /// Target cluster for cluster-side resources; `None` for cloud resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ResourceId {
    /// Identity of a cloud-scoped resource
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            target: None,
        }
    }

    /// Scope the identity to a target cluster
    pub fn with_target(mut self, target: Option<&str>) -> Self {
        self.target = target.map(str::to_string);
        self
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}::{}/{}", self.kind, target, self.name),
            None => write!(f, "{}::{}", self.kind, self.name),
        }
    }
}

/// Handle to a registered declaration
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    id: ResourceId,
}

impl ResourceRef {
    /// Identity of the referenced declaration
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Logical name of the referenced declaration
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Interpolation token for an output only known after apply
    pub fn output(&self, property: &str) -> String {
        format!("${{{}.{}}}", self.id, property)
    }
}

/// A single provider declaration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    /// Identity
    pub id: ResourceId,
    /// Which backend realises the declaration
    pub backend: Backend,
    /// Provider object body
    pub body: Value,
    /// Declarations that must exist before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ResourceId>,
}

/// Ordered collection of declarations with dependency edges
#[derive(Debug, Default)]
pub struct ResourceGraph {
    declarations: Vec<Declaration>,
    index: HashMap<ResourceId, usize>,
}

impl ResourceGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration.
    ///
    /// Fails if the identity is already taken or a dependency is unknown.
    pub fn register<T: Serialize>(
        &mut self,
        id: ResourceId,
        backend: Backend,
        body: &T,
        depends_on: &[ResourceRef],
    ) -> Result<ResourceRef> {
        if self.index.contains_key(&id) {
            return Err(Error::DuplicateResource { id });
        }

        let mut deps: Vec<ResourceId> = Vec::with_capacity(depends_on.len());
        let mut seen = BTreeSet::new();
        for dep in depends_on {
            if !self.index.contains_key(&dep.id) {
                return Err(Error::UnknownDependency {
                    id,
                    dependency: dep.id.clone(),
                });
            }
            if seen.insert(dep.id.clone()) {
                deps.push(dep.id.clone());
            }
        }

        let body = serde_json::to_value(body)?;
        debug!(id = %id, deps = deps.len(), "registered declaration");

        self.index.insert(id.clone(), self.declarations.len());
        self.declarations.push(Declaration {
            id: id.clone(),
            backend,
            body,
            depends_on: deps,
        });
        Ok(ResourceRef { id })
    }

    /// Handle to an already registered declaration
    pub fn lookup(&self, id: &ResourceId) -> Option<ResourceRef> {
        self.index
            .contains_key(id)
            .then(|| ResourceRef { id: id.clone() })
    }

    /// Declaration by identity
    pub fn get(&self, id: &ResourceId) -> Option<&Declaration> {
        self.index.get(id).map(|&i| &self.declarations[i])
    }

    /// Whether an identity is registered
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// All declarations in creation order
    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Declarations of one kind in creation order
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Declaration> + 'a {
        self.declarations.iter().filter(move |d| d.id.kind == kind)
    }

    /// Number of declarations
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Direct dependencies of a declaration
    pub fn dependencies_of(&self, id: &ResourceId) -> &[ResourceId] {
        self.get(id).map(|d| d.depends_on.as_slice()).unwrap_or(&[])
    }

    /// Whether `id` depends on `dependency`, directly or transitively
    pub fn depends_on(&self, id: &ResourceId, dependency: &ResourceId) -> bool {
        let mut stack: Vec<&ResourceId> = self.dependencies_of(id).iter().collect();
        let mut visited = BTreeSet::new();
        while let Some(next) = stack.pop() {
            if next == dependency {
                return true;
            }
            if visited.insert(next) {
                stack.extend(self.dependencies_of(next));
            }
        }
        false
    }

    /// Declarations realised by the given backend, in creation order
    pub fn for_backend(&self, backend: Backend) -> impl Iterator<Item = &Declaration> {
        self.declarations
            .iter()
            .filter(move |d| d.backend == backend)
    }

    /// Render all declarations as a multi-document YAML stream
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for decl in &self.declarations {
            out.push_str("---\n");
            out.push_str(&format!("# {}\n", decl.id));
            if !decl.depends_on.is_empty() {
                let deps: Vec<String> = decl.depends_on.iter().map(|d| d.to_string()).collect();
                out.push_str(&format!("# dependsOn: {}\n", deps.join(", ")));
            }
            out.push_str(&serde_yaml::to_string(&decl.body)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic(name: &str) -> ResourceId {
        ResourceId::new("gcp:pubsub:Topic", name)
    }

    #[test]
    fn register_and_lookup() {
        let mut graph = ResourceGraph::new();
        let r = graph
            .register(topic("events"), Backend::Managed, &json!({"name": "events"}), &[])
            .unwrap();
        assert_eq!(r.name(), "events");
        assert!(graph.contains(&topic("events")));
        assert_eq!(graph.get(&topic("events")).unwrap().body["name"], "events");
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut graph = ResourceGraph::new();
        graph
            .register(topic("events"), Backend::Managed, &json!({}), &[])
            .unwrap();
        let err = graph
            .register(topic("events"), Backend::Managed, &json!({}), &[])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateResource { .. }));
    }

    #[test]
    fn same_name_on_different_targets_is_allowed() {
        let mut graph = ResourceGraph::new();
        let kind = "kubernetes:apps/v1:Deployment";
        graph
            .register(
                ResourceId::new(kind, "orders/api").with_target(Some("east")),
                Backend::Managed,
                &json!({}),
                &[],
            )
            .unwrap();
        graph
            .register(
                ResourceId::new(kind, "orders/api").with_target(Some("west")),
                Backend::Managed,
                &json!({}),
                &[],
            )
            .unwrap();
        assert_eq!(graph.of_kind(kind).count(), 2);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut graph = ResourceGraph::new();
        let mut other = ResourceGraph::new();
        let foreign = other
            .register(topic("elsewhere"), Backend::Managed, &json!({}), &[])
            .unwrap();
        let err = graph
            .register(topic("events"), Backend::Managed, &json!({}), &[foreign])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn transitive_dependencies_are_found() {
        let mut graph = ResourceGraph::new();
        let a = graph
            .register(topic("a"), Backend::Managed, &json!({}), &[])
            .unwrap();
        let b = graph
            .register(topic("b"), Backend::Managed, &json!({}), &[a.clone()])
            .unwrap();
        let c = graph
            .register(topic("c"), Backend::Managed, &json!({}), &[b.clone(), b])
            .unwrap();
        assert_eq!(graph.dependencies_of(c.id()).len(), 1);
        assert!(graph.depends_on(c.id(), a.id()));
        assert!(!graph.depends_on(a.id(), c.id()));
    }

    #[test]
    fn output_token_names_resource_and_property() {
        let mut graph = ResourceGraph::new();
        let r = graph
            .register(topic("events"), Backend::Managed, &json!({}), &[])
            .unwrap();
        assert_eq!(r.output("id"), "${gcp:pubsub:Topic::events.id}");
    }

    #[test]
    fn yaml_rendering_lists_every_declaration() {
        let mut graph = ResourceGraph::new();
        let a = graph
            .register(topic("a"), Backend::Managed, &json!({"name": "a"}), &[])
            .unwrap();
        graph
            .register(topic("b"), Backend::Local, &json!({"name": "b"}), &[a])
            .unwrap();
        let yaml = graph.to_yaml().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 2);
        assert!(yaml.contains("# dependsOn: gcp:pubsub:Topic::a"));
        assert_eq!(graph.for_backend(Backend::Local).count(), 1);
    }
}

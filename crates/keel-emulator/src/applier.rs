//! Applies the local part of a resource graph
//!
//! Managed declarations belong to the orchestration engine; this applier
//! only realises [`Backend::Local`] declarations, in declaration order,
//! which already respects every dependency edge.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use keel_common::dynamic::DynamicProvider;
use keel_common::{Backend, Error, ResourceGraph, ResourceId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// What was last applied for one declaration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedResource {
    /// Declaration kind
    pub kind: String,
    /// Inputs the provider was called with
    pub inputs: Value,
    /// Outputs the provider returned
    pub outputs: Value,
}

/// State carried between applies, keyed by declaration id
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    /// Applied resources
    pub resources: BTreeMap<String, AppliedResource>,
}

impl AppliedState {
    /// Parse state saved by [`AppliedState::to_json`]
    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    /// Serialize for persistence between runs
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Outputs of an applied declaration
    pub fn outputs(&self, id: &ResourceId) -> Option<&Value> {
        self.resources.get(&id.to_string()).map(|r| &r.outputs)
    }
}

/// Per-declaration outcome counts of one apply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Newly created (or replaced)
    pub created: Vec<ResourceId>,
    /// Updated in place
    pub updated: Vec<ResourceId>,
    /// Inputs unchanged since the last apply
    pub unchanged: Vec<ResourceId>,
}

/// Runs dynamic providers over the local declarations of a graph
#[derive(Default)]
pub struct DynamicApplier {
    providers: HashMap<&'static str, Arc<dyn DynamicProvider>>,
}

impl DynamicApplier {
    /// Applier with no providers
    pub fn new() -> Self {
        Self::default()
    }

    /// Applier with the given providers
    pub fn with_providers(providers: impl IntoIterator<Item = Arc<dyn DynamicProvider>>) -> Self {
        let mut applier = Self::new();
        for provider in providers {
            applier.register(provider);
        }
        applier
    }

    /// Register a provider for its kind, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn DynamicProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Realise every local declaration, diffing against `state`
    pub async fn apply(&self, graph: &ResourceGraph, state: &mut AppliedState) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        for decl in graph.for_backend(Backend::Local) {
            let provider = self.providers.get(decl.id.kind.as_str()).ok_or_else(|| {
                Error::provider(
                    "dynamic",
                    format!("no provider registered for kind {}", decl.id.kind),
                )
            })?;
            let key = decl.id.to_string();

            let outputs = match state.resources.get(&key) {
                None => {
                    let outputs = provider.create(&decl.body).await?;
                    summary.created.push(decl.id.clone());
                    outputs
                }
                Some(applied) => {
                    let diff = provider.diff(&applied.inputs, &decl.body).await?;
                    if !diff.changes {
                        debug!(id = %decl.id, "unchanged");
                        summary.unchanged.push(decl.id.clone());
                        continue;
                    }
                    if diff.requires_replace() {
                        info!(id = %decl.id, fields = ?diff.replaces, "replacing");
                        let outputs = provider.replace(&applied.inputs, &decl.body).await?;
                        summary.created.push(decl.id.clone());
                        outputs
                    } else {
                        let outputs = provider.update(&applied.inputs, &decl.body).await?;
                        summary.updated.push(decl.id.clone());
                        outputs
                    }
                }
            };

            state.resources.insert(
                key,
                AppliedResource {
                    kind: decl.id.kind.clone(),
                    inputs: decl.body.clone(),
                    outputs,
                },
            );
        }

        info!(
            created = summary.created.len(),
            updated = summary.updated.len(),
            unchanged = summary.unchanged.len(),
            "local apply finished"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for DynamicApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&&str> = self.providers.keys().collect();
        kinds.sort();
        f.debug_struct("DynamicApplier").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LocalContext;
    use crate::providers::local_providers;
    use crate::pubsub::MockPubSubAdmin;
    use crate::sql::MockSqlAdmin;
    use keel_common::{DeployContext, Environment};
    use keel_gcp::pubsub::{
        create_subscription, create_topic, SubscriptionOptions, TopicOptions,
        KIND_LOCAL_SUBSCRIPTION,
    };
    use serde_json::json;

    fn adhoc() -> DeployContext {
        DeployContext::new("acme-dev", "europe-west1", Environment::Adhoc).for_target("local")
    }

    fn graph_with_topic_and_subscription(ack: u32) -> ResourceGraph {
        let ctx = adhoc();
        let mut graph = ResourceGraph::new();
        let topic = create_topic(&mut graph, &ctx, &TopicOptions::named("orders")).unwrap();
        let mut sub = SubscriptionOptions::pull("orders-worker");
        sub.ack_deadline_seconds = ack;
        create_subscription(&mut graph, &ctx, &topic, &sub).unwrap();
        graph
    }

    fn applier(pubsub: MockPubSubAdmin) -> DynamicApplier {
        let ctx = Arc::new(LocalContext::with_clients(
            Arc::new(pubsub),
            Arc::new(MockSqlAdmin::new()),
        ));
        DynamicApplier::with_providers(local_providers(ctx))
    }

    // =========================================================================
    // Story: First apply creates, second apply diffs
    // =========================================================================

    #[tokio::test]
    async fn first_apply_creates_in_dependency_order() {
        let mut pubsub = MockPubSubAdmin::new();
        let mut seq = mockall::Sequence::new();
        pubsub
            .expect_topic_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(false));
        pubsub
            .expect_create_topic()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        pubsub
            .expect_subscription_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(false));
        pubsub
            .expect_create_subscription()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let graph = graph_with_topic_and_subscription(10);
        let mut state = AppliedState::default();
        let summary = applier(pubsub).apply(&graph, &mut state).await.unwrap();

        assert_eq!(summary.created.len(), 2);
        assert_eq!(state.resources.len(), 2);
    }

    #[tokio::test]
    async fn unchanged_inputs_skip_the_provider() {
        let graph = graph_with_topic_and_subscription(10);
        let mut state = AppliedState::default();
        for decl in graph.for_backend(Backend::Local) {
            state.resources.insert(
                decl.id.to_string(),
                AppliedResource {
                    kind: decl.id.kind.clone(),
                    inputs: decl.body.clone(),
                    outputs: json!({}),
                },
            );
        }

        // no expectations: any call would panic
        let summary = applier(MockPubSubAdmin::new())
            .apply(&graph, &mut state)
            .await
            .unwrap();
        assert_eq!(summary.unchanged.len(), 2);
        assert!(summary.created.is_empty());
    }

    #[tokio::test]
    async fn changed_ack_deadline_replaces_the_subscription() {
        let mut state = AppliedState::default();
        for decl in graph_with_topic_and_subscription(10).for_backend(Backend::Local) {
            state.resources.insert(
                decl.id.to_string(),
                AppliedResource {
                    kind: decl.id.kind.clone(),
                    inputs: decl.body.clone(),
                    outputs: json!({}),
                },
            );
        }

        let mut pubsub = MockPubSubAdmin::new();
        let mut seq = mockall::Sequence::new();
        pubsub
            .expect_delete_subscription()
            .withf(|project, name| project == "acme-dev" && name == "orders-worker")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        pubsub
            .expect_subscription_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(false));
        pubsub
            .expect_create_subscription()
            .withf(|_, spec| spec.ack_deadline_seconds == 30)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let graph = graph_with_topic_and_subscription(30);
        let summary = applier(pubsub).apply(&graph, &mut state).await.unwrap();
        assert_eq!(summary.unchanged.len(), 1);
        assert_eq!(summary.created.len(), 1);

        let key = graph.of_kind(KIND_LOCAL_SUBSCRIPTION).next().unwrap().id.to_string();
        assert_eq!(state.resources[&key].inputs["ackDeadlineSeconds"], 30);
    }

    #[tokio::test]
    async fn missing_provider_is_an_error() {
        let graph = graph_with_topic_and_subscription(10);
        let err = DynamicApplier::new()
            .apply(&graph, &mut AppliedState::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no provider registered"));
    }

    #[test]
    fn state_survives_a_json_round_trip() {
        let mut state = AppliedState::default();
        state.resources.insert(
            "keel:local:PubSubTopic::orders".to_string(),
            AppliedResource {
                kind: "keel:local:PubSubTopic".to_string(),
                inputs: json!({"name": "orders"}),
                outputs: json!({"id": "projects/acme-dev/topics/orders"}),
            },
        );
        let parsed = AppliedState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(parsed, state);
    }
}

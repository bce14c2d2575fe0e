//! Dynamic providers for local declarations
//!
//! Each provider checks existence first and creates only when missing, so
//! re-running against a long-lived emulator is a no-op. Subscriptions are
//! deleted before a replacement is created.

use std::sync::Arc;

use async_trait::async_trait;
use keel_common::dynamic::{diff_inputs, DiffResult, DynamicProvider};
use keel_common::Result;
use keel_gcp::pubsub::{topic_id, KIND_LOCAL_SUBSCRIPTION, KIND_LOCAL_TOPIC};
use keel_gcp::sql::{LocalSqlConnection, KIND_LOCAL_DATABASE};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::context::LocalContext;
use crate::pubsub::SubscriptionSpec;

const PUBSUB_PROVIDER: &str = "local-pubsub";
const SQL_PROVIDER: &str = "local-sql";

#[derive(Deserialize)]
struct TopicInputs {
    name: String,
    project: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionInputs {
    name: String,
    project: String,
    topic: String,
    ack_deadline_seconds: u32,
    #[serde(default)]
    push_config: Option<PushConfigInputs>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushConfigInputs {
    push_endpoint: String,
}

#[derive(Deserialize)]
struct DatabaseInputs {
    name: String,
    connection: LocalSqlConnection,
}

/// Emulator topics
#[derive(Clone, Debug)]
pub struct LocalTopicProvider {
    ctx: Arc<LocalContext>,
}

impl LocalTopicProvider {
    /// Provider using the context's Pub/Sub client
    pub fn new(ctx: Arc<LocalContext>) -> Self {
        Self { ctx }
    }

    async fn ensure(&self, inputs: &Value) -> Result<Value> {
        let inputs: TopicInputs = serde_json::from_value(inputs.clone())?;
        let admin = self
            .ctx
            .pubsub()
            .await
            .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        let exists = admin
            .topic_exists(&inputs.project, &inputs.name)
            .await
            .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        if !exists {
            admin
                .create_topic(&inputs.project, &inputs.name)
                .await
                .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        }
        info!(topic = %inputs.name, created = !exists, "local topic ready");
        Ok(json!({
            "name": inputs.name,
            "id": topic_id(&inputs.project, &inputs.name),
        }))
    }
}

#[async_trait]
impl DynamicProvider for LocalTopicProvider {
    fn kind(&self) -> &'static str {
        KIND_LOCAL_TOPIC
    }

    async fn create(&self, inputs: &Value) -> Result<Value> {
        self.ensure(inputs).await
    }

    async fn diff(&self, old: &Value, new: &Value) -> Result<DiffResult> {
        Ok(diff_inputs(old, new, &["name", "project"]))
    }

    async fn update(&self, _old: &Value, new: &Value) -> Result<Value> {
        self.ensure(new).await
    }
}

/// Emulator subscriptions
#[derive(Clone, Debug)]
pub struct LocalSubscriptionProvider {
    ctx: Arc<LocalContext>,
}

impl LocalSubscriptionProvider {
    /// Provider using the context's Pub/Sub client
    pub fn new(ctx: Arc<LocalContext>) -> Self {
        Self { ctx }
    }

    async fn ensure(&self, inputs: &Value) -> Result<Value> {
        let inputs: SubscriptionInputs = serde_json::from_value(inputs.clone())?;
        let admin = self
            .ctx
            .pubsub()
            .await
            .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        let exists = admin
            .subscription_exists(&inputs.project, &inputs.name)
            .await
            .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        if !exists {
            let spec = SubscriptionSpec {
                name: inputs.name.clone(),
                topic: inputs.topic.clone(),
                ack_deadline_seconds: inputs.ack_deadline_seconds,
                push_endpoint: inputs.push_config.map(|p| p.push_endpoint),
            };
            admin
                .create_subscription(&inputs.project, &spec)
                .await
                .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        }
        info!(subscription = %inputs.name, topic = %inputs.topic, created = !exists, "local subscription ready");
        Ok(json!({
            "name": inputs.name,
            "topic": inputs.topic,
        }))
    }
}

#[async_trait]
impl DynamicProvider for LocalSubscriptionProvider {
    fn kind(&self) -> &'static str {
        KIND_LOCAL_SUBSCRIPTION
    }

    async fn create(&self, inputs: &Value) -> Result<Value> {
        self.ensure(inputs).await
    }

    async fn diff(&self, old: &Value, new: &Value) -> Result<DiffResult> {
        // the emulator has no subscription patch endpoint
        Ok(diff_inputs(
            old,
            new,
            &["name", "project", "topic", "pushConfig", "ackDeadlineSeconds"],
        ))
    }

    async fn update(&self, _old: &Value, new: &Value) -> Result<Value> {
        self.ensure(new).await
    }

    async fn replace(&self, old: &Value, new: &Value) -> Result<Value> {
        let previous: SubscriptionInputs = serde_json::from_value(old.clone())?;
        let admin = self
            .ctx
            .pubsub()
            .await
            .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        admin
            .delete_subscription(&previous.project, &previous.name)
            .await
            .map_err(|e| e.into_provider(PUBSUB_PROVIDER))?;
        info!(subscription = %previous.name, "local subscription deleted for replacement");
        self.ensure(new).await
    }
}

/// Databases on the local SQL server
#[derive(Clone, Debug)]
pub struct LocalDatabaseProvider {
    ctx: Arc<LocalContext>,
}

impl LocalDatabaseProvider {
    /// Provider using the context's SQL client
    pub fn new(ctx: Arc<LocalContext>) -> Self {
        Self { ctx }
    }

    async fn ensure(&self, inputs: &Value) -> Result<Value> {
        let inputs: DatabaseInputs = serde_json::from_value(inputs.clone())?;
        let admin = self
            .ctx
            .sql()
            .await
            .map_err(|e| e.into_provider(SQL_PROVIDER))?;
        let exists = admin
            .database_exists(&inputs.connection, &inputs.name)
            .await
            .map_err(|e| e.into_provider(SQL_PROVIDER))?;
        if !exists {
            admin
                .create_database(&inputs.connection, &inputs.name)
                .await
                .map_err(|e| e.into_provider(SQL_PROVIDER))?;
        }
        info!(
            database = %inputs.name,
            engine = %inputs.connection.engine,
            created = !exists,
            "local database ready"
        );
        Ok(json!({
            "name": inputs.name,
            "engine": inputs.connection.engine,
        }))
    }
}

#[async_trait]
impl DynamicProvider for LocalDatabaseProvider {
    fn kind(&self) -> &'static str {
        KIND_LOCAL_DATABASE
    }

    async fn create(&self, inputs: &Value) -> Result<Value> {
        self.ensure(inputs).await
    }

    async fn diff(&self, old: &Value, new: &Value) -> Result<DiffResult> {
        Ok(diff_inputs(old, new, &["name", "connection"]))
    }

    async fn update(&self, _old: &Value, new: &Value) -> Result<Value> {
        self.ensure(new).await
    }
}

/// One provider per local declaration kind, sharing `ctx`
pub fn local_providers(ctx: Arc<LocalContext>) -> Vec<Arc<dyn DynamicProvider>> {
    vec![
        Arc::new(LocalTopicProvider::new(ctx.clone())),
        Arc::new(LocalSubscriptionProvider::new(ctx.clone())),
        Arc::new(LocalDatabaseProvider::new(ctx)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmulatorError;
    use crate::pubsub::MockPubSubAdmin;
    use crate::sql::MockSqlAdmin;
    use keel_gcp::sql::local_connection;

    fn context(pubsub: MockPubSubAdmin, sql: MockSqlAdmin) -> Arc<LocalContext> {
        Arc::new(LocalContext::with_clients(Arc::new(pubsub), Arc::new(sql)))
    }

    // =========================================================================
    // Story: Topics are created only when the emulator lacks them
    // =========================================================================

    #[tokio::test]
    async fn missing_topic_is_created() {
        let mut pubsub = MockPubSubAdmin::new();
        pubsub
            .expect_topic_exists()
            .withf(|project, topic| project == "acme-dev" && topic == "orders")
            .returning(|_, _| Ok(false));
        pubsub
            .expect_create_topic()
            .withf(|project, topic| project == "acme-dev" && topic == "orders")
            .times(1)
            .returning(|_, _| Ok(()));

        let provider = LocalTopicProvider::new(context(pubsub, MockSqlAdmin::new()));
        let out = provider
            .create(&json!({"name": "orders", "project": "acme-dev"}))
            .await
            .unwrap();
        assert_eq!(out["id"], "projects/acme-dev/topics/orders");
    }

    #[tokio::test]
    async fn existing_topic_is_left_alone() {
        let mut pubsub = MockPubSubAdmin::new();
        pubsub.expect_topic_exists().returning(|_, _| Ok(true));
        pubsub.expect_create_topic().never();

        let provider = LocalTopicProvider::new(context(pubsub, MockSqlAdmin::new()));
        provider
            .create(&json!({"name": "orders", "project": "acme-dev"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn emulator_failure_surfaces_as_provider_error() {
        let mut pubsub = MockPubSubAdmin::new();
        pubsub.expect_topic_exists().returning(|_, _| {
            Err(EmulatorError::Api {
                status: 500,
                message: "boom".to_string(),
            })
        });

        let provider = LocalTopicProvider::new(context(pubsub, MockSqlAdmin::new()));
        let err = provider
            .create(&json!({"name": "orders", "project": "acme-dev"}))
            .await
            .unwrap_err();
        assert!(matches!(err, keel_common::Error::Provider { ref provider, .. } if provider == "local-pubsub"));
    }

    #[tokio::test]
    async fn topic_rename_requires_replace() {
        let provider = LocalTopicProvider::new(context(MockPubSubAdmin::new(), MockSqlAdmin::new()));
        let diff = provider
            .diff(
                &json!({"name": "a", "project": "p"}),
                &json!({"name": "b", "project": "p"}),
            )
            .await
            .unwrap();
        assert!(diff.requires_replace());
    }

    // =========================================================================
    // Story: Subscriptions carry their push endpoint to the emulator
    // =========================================================================

    #[tokio::test]
    async fn push_subscription_is_created_with_endpoint() {
        let mut pubsub = MockPubSubAdmin::new();
        pubsub.expect_subscription_exists().returning(|_, _| Ok(false));
        pubsub
            .expect_create_subscription()
            .withf(|project, spec| {
                project == "acme-dev"
                    && spec.topic == "projects/acme-dev/topics/orders"
                    && spec.push_endpoint.as_deref() == Some("http://orders-api:8080/push")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let provider = LocalSubscriptionProvider::new(context(pubsub, MockSqlAdmin::new()));
        provider
            .create(&json!({
                "name": "orders-push",
                "project": "acme-dev",
                "topic": "projects/acme-dev/topics/orders",
                "ackDeadlineSeconds": 10,
                "pushConfig": {
                    "pushEndpoint": "http://orders-api:8080/push",
                    "oidcToken": {"serviceAccountEmail": "x", "audience": "y"}
                },
                "retryPolicy": {"minimumBackoff": "1s", "maximumBackoff": "10s"}
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn changed_push_endpoint_deletes_then_recreates() {
        let mut pubsub = MockPubSubAdmin::new();
        let mut seq = mockall::Sequence::new();
        pubsub
            .expect_delete_subscription()
            .withf(|project, name| project == "acme-dev" && name == "orders-push")
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
            .withf(|_, spec| spec.push_endpoint.as_deref() == Some("http://new:8080/push"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let subscription = |endpoint: &str| {
            json!({
                "name": "orders-push",
                "project": "acme-dev",
                "topic": "projects/acme-dev/topics/orders",
                "ackDeadlineSeconds": 10,
                "pushConfig": {"pushEndpoint": endpoint}
            })
        };
        let old = subscription("http://old:8080/push");
        let new = subscription("http://new:8080/push");

        let provider = LocalSubscriptionProvider::new(context(pubsub, MockSqlAdmin::new()));
        assert!(provider.diff(&old, &new).await.unwrap().requires_replace());
        provider.replace(&old, &new).await.unwrap();
    }

    // =========================================================================
    // Story: Databases are created on the local server when missing
    // =========================================================================

    #[tokio::test]
    async fn missing_database_is_created() {
        let connection = local_connection("POSTGRES_15").unwrap();
        let mut sql = MockSqlAdmin::new();
        sql.expect_database_exists()
            .withf(|conn, name| conn.user == "postgres" && name == "orders")
            .returning(|_, _| Ok(false));
        sql.expect_create_database()
            .times(1)
            .returning(|_, _| Ok(()));

        let provider = LocalDatabaseProvider::new(context(MockPubSubAdmin::new(), sql));
        let out = provider
            .create(&json!({"name": "orders", "connection": connection}))
            .await
            .unwrap();
        assert_eq!(out["engine"], "postgres");
    }

    #[tokio::test]
    async fn malformed_inputs_are_rejected() {
        let provider = LocalDatabaseProvider::new(context(MockPubSubAdmin::new(), MockSqlAdmin::new()));
        assert!(provider.create(&json!({"name": "orders"})).await.is_err());
    }
}

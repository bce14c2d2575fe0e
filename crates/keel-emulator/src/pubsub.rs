//! Pub/Sub emulator client
//!
//! The emulator speaks the Pub/Sub REST surface without authentication.
//! Creation treats `409 Conflict` as success, deletion treats `404 Not Found`
//! as success.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{EmulatorError, EmulatorResult};

/// Subscription settings sent to the emulator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// Short subscription name
    pub name: String,
    /// Fully-qualified topic path
    pub topic: String,
    /// Ack deadline
    pub ack_deadline_seconds: u32,
    /// Push endpoint; pull when absent
    pub push_endpoint: Option<String>,
}

/// Topic and subscription administration on the emulator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PubSubAdmin: Send + Sync {
    /// Whether the topic exists
    async fn topic_exists(&self, project: &str, topic: &str) -> EmulatorResult<bool>;

    /// Create the topic; an existing topic is not an error
    async fn create_topic(&self, project: &str, topic: &str) -> EmulatorResult<()>;

    /// Whether the subscription exists
    async fn subscription_exists(&self, project: &str, subscription: &str)
        -> EmulatorResult<bool>;

    /// Create the subscription; an existing subscription is not an error
    async fn create_subscription(&self, project: &str, spec: &SubscriptionSpec)
        -> EmulatorResult<()>;

    /// Delete the subscription; a missing subscription is not an error
    async fn delete_subscription(&self, project: &str, subscription: &str)
        -> EmulatorResult<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest<'a> {
    topic: &'a str,
    ack_deadline_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    push_config: Option<PushConfig<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushConfig<'a> {
    push_endpoint: &'a str,
}

/// REST client for a running Pub/Sub emulator
#[derive(Clone, Debug)]
pub struct EmulatorPubSub {
    client: Client,
    base_url: String,
}

impl EmulatorPubSub {
    /// Client for the emulator at `base_url` (e.g. `http://localhost:8085`)
    pub fn new(base_url: &str) -> EmulatorResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn topic_url(&self, project: &str, topic: &str) -> String {
        format!("{}/v1/projects/{}/topics/{}", self.base_url, project, topic)
    }

    fn subscription_url(&self, project: &str, subscription: &str) -> String {
        format!(
            "{}/v1/projects/{}/subscriptions/{}",
            self.base_url, project, subscription
        )
    }

    async fn exists(&self, url: &str) -> EmulatorResult<bool> {
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(api_error(status, response).await),
        }
    }

    async fn put<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> EmulatorResult<()> {
        let response = self.client.put(url).json(body).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                debug!(url = %url, "already exists");
                Ok(())
            }
            status => Err(api_error(status, response).await),
        }
    }

    async fn delete(&self, url: &str) -> EmulatorResult<()> {
        let response = self.client.delete(url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "already gone");
                Ok(())
            }
            status => Err(api_error(status, response).await),
        }
    }
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> EmulatorError {
    let message = response.text().await.unwrap_or_default();
    EmulatorError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl PubSubAdmin for EmulatorPubSub {
    async fn topic_exists(&self, project: &str, topic: &str) -> EmulatorResult<bool> {
        self.exists(&self.topic_url(project, topic)).await
    }

    async fn create_topic(&self, project: &str, topic: &str) -> EmulatorResult<()> {
        self.put(&self.topic_url(project, topic), &serde_json::json!({}))
            .await
    }

    async fn subscription_exists(
        &self,
        project: &str,
        subscription: &str,
    ) -> EmulatorResult<bool> {
        self.exists(&self.subscription_url(project, subscription))
            .await
    }

    async fn create_subscription(
        &self,
        project: &str,
        spec: &SubscriptionSpec,
    ) -> EmulatorResult<()> {
        let body = SubscriptionRequest {
            topic: &spec.topic,
            ack_deadline_seconds: spec.ack_deadline_seconds,
            push_config: spec
                .push_endpoint
                .as_deref()
                .map(|push_endpoint| PushConfig { push_endpoint }),
        };
        self.put(&self.subscription_url(project, &spec.name), &body)
            .await
    }

    async fn delete_subscription(
        &self,
        project: &str,
        subscription: &str,
    ) -> EmulatorResult<()> {
        self.delete(&self.subscription_url(project, subscription))
            .await
    }
}

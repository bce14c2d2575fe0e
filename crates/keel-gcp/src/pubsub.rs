//! Pub/Sub topics and subscriptions
//!
//! Managed environments declare real topics/subscriptions. Adhoc
//! environments declare local dynamic resources that the emulator provider
//! creates on apply (checking existence first).

use std::collections::BTreeMap;

use keel_common::config::StackReference;
use keel_common::{Backend, DeployContext, Error, ResourceGraph, ResourceRef, Result};
use serde::Serialize;
use tracing::info;

use crate::iam::push_invoker_email;

/// Managed Pub/Sub topic
pub const KIND_TOPIC: &str = "gcp:pubsub:Topic";
/// Managed Pub/Sub subscription
pub const KIND_SUBSCRIPTION: &str = "gcp:pubsub:Subscription";
/// Emulator-backed topic
pub const KIND_LOCAL_TOPIC: &str = "keel:local:PubSubTopic";
/// Emulator-backed subscription
pub const KIND_LOCAL_SUBSCRIPTION: &str = "keel:local:PubSubSubscription";

/// Options for [`create_topic`]
#[derive(Clone, Debug, Default)]
pub struct TopicOptions {
    /// Topic name
    pub name: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Message retention (e.g. `86600s`)
    pub message_retention: Option<String>,
}

impl TopicOptions {
    /// Topic with just a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A declared topic
#[derive(Clone, Debug)]
pub struct TopicHandle {
    /// Topic name
    pub name: String,
    /// Fully-qualified topic id (`projects/<p>/topics/<name>`)
    pub id: String,
    /// Declaration
    pub resource: ResourceRef,
}

/// How messages are delivered to a subscription
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// Subscribers pull
    Pull,
    /// Messages are pushed to an HTTPS endpoint
    Push {
        /// Push endpoint URL
        endpoint: String,
        /// Service account whose OIDC token authenticates the push
        identity: Option<String>,
    },
}

/// Exponential backoff bounds for redelivery
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Minimum backoff (e.g. `10s`)
    pub minimum_backoff: String,
    /// Maximum backoff (e.g. `600s`)
    pub maximum_backoff: String,
}

impl RetryPolicy {
    /// Default backoff for the environment; adhoc uses short bounds
    pub fn for_context(ctx: &DeployContext) -> Self {
        if ctx.is_adhoc() {
            Self {
                minimum_backoff: "1s".to_string(),
                maximum_backoff: "10s".to_string(),
            }
        } else {
            Self {
                minimum_backoff: "10s".to_string(),
                maximum_backoff: "600s".to_string(),
            }
        }
    }
}

/// Options for [`create_subscription`]
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// Subscription name
    pub name: String,
    /// Delivery mode
    pub delivery: Delivery,
    /// Ack deadline in seconds
    pub ack_deadline_seconds: u32,
    /// Message filter expression
    pub filter: Option<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

impl SubscriptionOptions {
    /// Pull subscription with default ack deadline
    pub fn pull(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delivery: Delivery::Pull,
            ack_deadline_seconds: 10,
            filter: None,
            labels: BTreeMap::new(),
        }
    }

    /// Push subscription with default ack deadline
    pub fn push(name: impl Into<String>, endpoint: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            delivery: Delivery::Push {
                endpoint: endpoint.into(),
                identity,
            },
            ..Self::pull(name)
        }
    }

    /// Push subscription authenticated as the push invoker another stack shares
    pub fn push_from_stack(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        stack: &StackReference,
    ) -> Result<Self> {
        Ok(Self::push(name, endpoint, Some(push_invoker_email(stack)?)))
    }
}

/// A declared subscription
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    /// Subscription name
    pub name: String,
    /// Declaration
    pub resource: ResourceRef,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicBody<'a> {
    name: &'a str,
    project: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_retention_duration: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionBody<'a> {
    name: &'a str,
    project: &'a str,
    topic: &'a str,
    ack_deadline_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    push_config: Option<PushConfig<'a>>,
    retry_policy: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushConfig<'a> {
    push_endpoint: &'a str,
    oidc_token: OidcToken<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken<'a> {
    service_account_email: &'a str,
    audience: &'a str,
}

/// Fully-qualified topic id
pub fn topic_id(project: &str, name: &str) -> String {
    format!("projects/{}/topics/{}", project, name)
}

/// Declare a topic (emulator-backed in adhoc environments)
pub fn create_topic(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &TopicOptions,
) -> Result<TopicHandle> {
    let kind = match ctx.backend() {
        Backend::Managed => KIND_TOPIC,
        Backend::Local => KIND_LOCAL_TOPIC,
    };

    let resource = graph.register(
        ctx.cloud_id(kind, &opts.name),
        ctx.backend(),
        &TopicBody {
            name: &opts.name,
            project: &ctx.project,
            labels: &opts.labels,
            message_retention_duration: opts.message_retention.as_deref(),
        },
        &[],
    )?;

    info!(topic = %opts.name, backend = ?ctx.backend(), "declared pubsub topic");
    Ok(TopicHandle {
        name: opts.name.clone(),
        id: topic_id(&ctx.project, &opts.name),
        resource,
    })
}

/// Reuse a topic already declared in the graph, or declare it
pub fn ensure_topic(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    name: &str,
) -> Result<TopicHandle> {
    for kind in [KIND_TOPIC, KIND_LOCAL_TOPIC] {
        if let Some(resource) = graph.lookup(&ctx.cloud_id(kind, name)) {
            return Ok(TopicHandle {
                name: name.to_string(),
                id: topic_id(&ctx.project, name),
                resource,
            });
        }
    }
    create_topic(graph, ctx, &TopicOptions::named(name))
}

/// Declare a subscription on a topic.
///
/// A push subscription without a target identity is rejected: pushes are
/// never sent unauthenticated.
pub fn create_subscription(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    topic: &TopicHandle,
    opts: &SubscriptionOptions,
) -> Result<SubscriptionHandle> {
    let push_config = match &opts.delivery {
        Delivery::Pull => None,
        Delivery::Push { endpoint, identity } => {
            let identity = identity.as_deref().ok_or_else(|| {
                Error::config(
                    "pubsub",
                    format!(
                        "push subscription '{}' requires a target identity",
                        opts.name
                    ),
                )
            })?;
            Some(PushConfig {
                push_endpoint: endpoint,
                oidc_token: OidcToken {
                    service_account_email: identity,
                    audience: endpoint,
                },
            })
        }
    };

    let kind = match ctx.backend() {
        Backend::Managed => KIND_SUBSCRIPTION,
        Backend::Local => KIND_LOCAL_SUBSCRIPTION,
    };

    let resource = graph.register(
        ctx.cloud_id(kind, &opts.name),
        ctx.backend(),
        &SubscriptionBody {
            name: &opts.name,
            project: &ctx.project,
            topic: &topic.id,
            ack_deadline_seconds: opts.ack_deadline_seconds,
            push_config,
            retry_policy: RetryPolicy::for_context(ctx),
            filter: opts.filter.as_deref(),
            labels: &opts.labels,
        },
        &[topic.resource.clone()],
    )?;

    info!(
        subscription = %opts.name,
        topic = %topic.name,
        push = matches!(opts.delivery, Delivery::Push { .. }),
        "declared pubsub subscription"
    );
    Ok(SubscriptionHandle {
        name: opts.name.clone(),
        resource,
    })
}

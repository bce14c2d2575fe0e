//! Cloud Scheduler jobs
//!
//! HTTP jobs call `<base>/<endpoint or job name>` with an OIDC token whose
//! audience is exactly that URI. Pub/Sub jobs publish to topics that are
//! declared once per distinct name.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use keel_common::{Backend, DeployContext, ResourceGraph, ResourceRef, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::pubsub::{ensure_topic, TopicHandle};

/// Cloud Scheduler job
pub const KIND_JOB: &str = "gcp:cloudscheduler:Job";

/// One HTTP-target job
#[derive(Clone, Debug, Default)]
pub struct HttpJob {
    /// Job name
    pub name: String,
    /// Cron schedule
    pub schedule: String,
    /// Path appended to the base URL; defaults to the job name
    pub endpoint: Option<String>,
    /// HTTP method (defaults to POST)
    pub http_method: Option<String>,
    /// Request body
    pub body: Option<String>,
}

/// Options for [`create_http_jobs`]
#[derive(Clone, Debug, Default)]
pub struct HttpJobsOptions {
    /// Base service URL
    pub base_url: String,
    /// Service account used to mint the OIDC token
    pub invoker_email: String,
    /// Schedule time zone
    pub time_zone: Option<String>,
    /// Jobs to declare
    pub jobs: Vec<HttpJob>,
    /// Extra dependencies for every job
    pub depends_on: Vec<ResourceRef>,
}

/// One Pub/Sub-target job
#[derive(Clone, Debug, Default)]
pub struct PubSubJob {
    /// Job name
    pub name: String,
    /// Cron schedule
    pub schedule: String,
    /// Topic name
    pub topic: String,
    /// Message payload
    pub data: Option<String>,
    /// Message attributes
    pub attributes: BTreeMap<String, String>,
}

/// Options for [`create_pubsub_jobs`]
#[derive(Clone, Debug, Default)]
pub struct PubSubJobsOptions {
    /// Schedule time zone
    pub time_zone: Option<String>,
    /// Jobs to declare
    pub jobs: Vec<PubSubJob>,
}

/// Result of [`create_pubsub_jobs`]
#[derive(Clone, Debug, Default)]
pub struct PubSubJobsHandle {
    /// Topic per distinct name
    pub topics: BTreeMap<String, TopicHandle>,
    /// Declared jobs
    pub jobs: Vec<ResourceRef>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobBody<'a> {
    name: &'a str,
    project: &'a str,
    region: &'a str,
    schedule: &'a str,
    time_zone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_target: Option<HttpTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pubsub_target: Option<PubSubTarget<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpTarget {
    uri: String,
    http_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    oidc_token: OidcToken,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken {
    service_account_email: String,
    audience: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PubSubTarget<'a> {
    topic_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: &'a BTreeMap<String, String>,
}

const DEFAULT_TIME_ZONE: &str = "Etc/UTC";

/// Invocation URI for an HTTP job
pub fn job_uri(base_url: &str, job: &HttpJob) -> String {
    let path = job.endpoint.as_deref().unwrap_or(&job.name);
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Declare HTTP-target jobs. Adhoc environments have no scheduler.
pub fn create_http_jobs(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &HttpJobsOptions,
) -> Result<Vec<ResourceRef>> {
    if ctx.is_adhoc() {
        debug!(jobs = opts.jobs.len(), "skipping scheduler jobs in adhoc environment");
        return Ok(Vec::new());
    }

    let time_zone = opts.time_zone.as_deref().unwrap_or(DEFAULT_TIME_ZONE);
    let mut refs = Vec::with_capacity(opts.jobs.len());
    for job in &opts.jobs {
        let uri = job_uri(&opts.base_url, job);
        let target = HttpTarget {
            http_method: job.http_method.clone().unwrap_or_else(|| "POST".to_string()),
            body: job.body.as_ref().map(|b| STANDARD.encode(b)),
            oidc_token: OidcToken {
                service_account_email: opts.invoker_email.clone(),
                audience: uri.clone(),
            },
            uri,
        };
        refs.push(graph.register(
            ctx.cloud_id(KIND_JOB, &job.name),
            Backend::Managed,
            &JobBody {
                name: &job.name,
                project: &ctx.project,
                region: &ctx.region,
                schedule: &job.schedule,
                time_zone,
                http_target: Some(target),
                pubsub_target: None,
            },
            &opts.depends_on,
        )?);
    }

    info!(jobs = refs.len(), "declared http scheduler jobs");
    Ok(refs)
}

/// Declare Pub/Sub-target jobs, one topic per distinct topic name
pub fn create_pubsub_jobs(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &PubSubJobsOptions,
) -> Result<PubSubJobsHandle> {
    let names: BTreeSet<&str> = opts.jobs.iter().map(|j| j.topic.as_str()).collect();
    let mut topics = BTreeMap::new();
    for name in names {
        topics.insert(name.to_string(), ensure_topic(graph, ctx, name)?);
    }

    if ctx.is_adhoc() {
        debug!(jobs = opts.jobs.len(), "skipping scheduler jobs in adhoc environment");
        return Ok(PubSubJobsHandle {
            topics,
            jobs: Vec::new(),
        });
    }

    let time_zone = opts.time_zone.as_deref().unwrap_or(DEFAULT_TIME_ZONE);
    let mut jobs = Vec::with_capacity(opts.jobs.len());
    for job in &opts.jobs {
        let Some(topic) = topics.get(&job.topic) else {
            continue;
        };
        jobs.push(graph.register(
            ctx.cloud_id(KIND_JOB, &job.name),
            Backend::Managed,
            &JobBody {
                name: &job.name,
                project: &ctx.project,
                region: &ctx.region,
                schedule: &job.schedule,
                time_zone,
                http_target: None,
                pubsub_target: Some(PubSubTarget {
                    topic_name: &topic.id,
                    data: job.data.as_ref().map(|d| STANDARD.encode(d)),
                    attributes: &job.attributes,
                }),
            },
            &[topic.resource.clone()],
        )?);
    }

    info!(
        jobs = jobs.len(),
        topics = topics.len(),
        "declared pubsub scheduler jobs"
    );
    Ok(PubSubJobsHandle { topics, jobs })
}

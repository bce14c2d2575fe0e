//! Migration jobs
//!
//! The job name carries a suffix derived from the image tag: redeploying the
//! same image keeps the same Job identity (no second run), a new tag makes a
//! new Job.

use std::collections::BTreeMap;

use keel_common::naming::migration_job_name;
use keel_common::{Backend, DeployContext, ObjectMeta, ResourceGraph, ResourceRef, Result};
use tracing::info;

use crate::k8s::{Job, JobSpec, KIND_JOB};
use crate::pod::{pod_template, ContainerOptions, PodOptions};

const DEFAULT_BACKOFF_LIMIT: u32 = 1;

/// Options for [`create_migration_job`]
#[derive(Clone, Debug, Default)]
pub struct MigrationJobOptions {
    /// Base name; the image suffix is appended
    pub base_name: String,
    /// Namespace
    pub namespace: String,
    /// Container
    pub container: ContainerOptions,
    /// KSA name
    pub service_account: Option<String>,
    /// Retries
    pub backoff_limit: Option<u32>,
    /// Seconds a finished job is kept
    pub ttl_seconds_after_finished: Option<u32>,
    /// Extra labels
    pub labels: BTreeMap<String, String>,
    /// Pod annotations
    pub pod_annotations: BTreeMap<String, String>,
    /// GKE node pool
    pub node_pool: Option<String>,
    /// Dependencies
    pub depends_on: Vec<ResourceRef>,
}

/// Declare a run-to-completion migration job
pub fn create_migration_job(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &MigrationJobOptions,
) -> Result<ResourceRef> {
    let name = migration_job_name(&opts.base_name, &opts.container.image);

    let pod = PodOptions {
        labels: opts.labels.clone(),
        annotations: opts.pod_annotations.clone(),
        service_account: opts.service_account.clone(),
        node_pool: opts.node_pool.clone(),
        ..Default::default()
    };
    let mut template = pod_template(&name, &pod, vec![opts.container.to_container("migrate")]);
    template.spec.restart_policy = Some("Never".to_string());

    let job = Job {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        metadata: ObjectMeta::new(&name, &opts.namespace).with_labels(&opts.labels),
        spec: JobSpec {
            backoff_limit: opts.backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT),
            ttl_seconds_after_finished: opts.ttl_seconds_after_finished,
            template,
        },
    };

    let resource = graph.register(
        ctx.cluster_id(KIND_JOB, &opts.namespace, &name),
        Backend::Managed,
        &job,
        &opts.depends_on,
    )?;
    info!(name = %name, namespace = %opts.namespace, target = ?ctx.target, "declared migration job");
    Ok(resource)
}

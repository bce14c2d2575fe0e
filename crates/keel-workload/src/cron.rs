//! Scheduled batch workloads

use std::collections::BTreeMap;

use keel_common::{Backend, DeployContext, ObjectMeta, ResourceGraph, ResourceRef, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::k8s::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec, KIND_CRON_JOB};
use crate::pod::{pod_template, ContainerOptions, PodOptions};
use crate::spot::{self, SpotPolicy};

/// Schedule declared for suspended crons: once a year, and never while suspended
pub const SUSPENDED_SCHEDULE: &str = "0 0 1 1 *";

/// What happens when a run is still active at the next tick
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    /// Run concurrently
    Allow,
    /// Skip the new run
    #[default]
    Forbid,
    /// Replace the running job
    Replace,
}

impl ConcurrencyPolicy {
    fn as_str(self) -> &'static str {
        match self {
            ConcurrencyPolicy::Allow => "Allow",
            ConcurrencyPolicy::Forbid => "Forbid",
            ConcurrencyPolicy::Replace => "Replace",
        }
    }
}

/// Options for [`create_cron_job`]
#[derive(Clone, Debug, Default)]
pub struct CronOptions {
    /// Cron name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Schedule
    pub schedule: String,
    /// Suspend the cron
    pub suspend: bool,
    /// Concurrency policy
    pub concurrency_policy: ConcurrencyPolicy,
    /// Container
    pub container: ContainerOptions,
    /// KSA name
    pub service_account: Option<String>,
    /// Retries per run
    pub backoff_limit: Option<u32>,
    /// Spot scheduling
    pub spot: SpotPolicy,
    /// GKE node pool
    pub node_pool: Option<String>,
    /// Extra labels
    pub labels: BTreeMap<String, String>,
    /// Pod annotations
    pub pod_annotations: BTreeMap<String, String>,
    /// Dependencies
    pub depends_on: Vec<ResourceRef>,
}

/// Schedule that is actually declared
pub fn effective_schedule(opts: &CronOptions) -> &str {
    if opts.suspend {
        SUSPENDED_SCHEDULE
    } else {
        &opts.schedule
    }
}

/// Declare a CronJob
pub fn create_cron_job(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &CronOptions,
) -> Result<ResourceRef> {
    let pod = PodOptions {
        labels: opts.labels.clone(),
        annotations: opts.pod_annotations.clone(),
        service_account: opts.service_account.clone(),
        spot: spot::compute(&opts.spot, ctx.environment),
        node_pool: opts.node_pool.clone(),
    };
    let mut template = pod_template(&opts.name, &pod, vec![opts.container.to_container(&opts.name)]);
    template.spec.restart_policy = Some("Never".to_string());

    let cron = CronJob {
        api_version: "batch/v1".to_string(),
        kind: "CronJob".to_string(),
        metadata: ObjectMeta::new(&opts.name, &opts.namespace).with_labels(&opts.labels),
        spec: CronJobSpec {
            schedule: effective_schedule(opts).to_string(),
            concurrency_policy: opts.concurrency_policy.as_str().to_string(),
            suspend: opts.suspend,
            successful_jobs_history_limit: 3,
            failed_jobs_history_limit: 1,
            job_template: JobTemplateSpec {
                spec: JobSpec {
                    backoff_limit: opts.backoff_limit.unwrap_or(0),
                    ttl_seconds_after_finished: None,
                    template,
                },
            },
        },
    };

    let resource = graph.register(
        ctx.cluster_id(KIND_CRON_JOB, &opts.namespace, &opts.name),
        Backend::Managed,
        &cron,
        &opts.depends_on,
    )?;
    info!(
        name = %opts.name,
        namespace = %opts.namespace,
        suspend = opts.suspend,
        "declared cron job"
    );
    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{adhoc, managed};
    use rstest::rstest;

    fn cron(schedule: &str, suspend: bool) -> CronOptions {
        CronOptions {
            name: "orders-cleanup".to_string(),
            namespace: "orders".to_string(),
            schedule: schedule.to_string(),
            suspend,
            container: ContainerOptions {
                image: "gcr.io/acme/orders:1".to_string(),
                ..Default::default()
            },
            spot: SpotPolicy::required(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case::every_minute("* * * * *")]
    #[case::hourly("0 * * * *")]
    #[case::garbage("not a schedule")]
    fn suspended_cron_uses_placeholder(#[case] schedule: &str) {
        let mut graph = ResourceGraph::new();
        let r = create_cron_job(&mut graph, &managed(), &cron(schedule, true)).unwrap();
        let spec = &graph.get(r.id()).unwrap().body["spec"];
        assert_eq!(spec["schedule"], SUSPENDED_SCHEDULE);
        assert_eq!(spec["suspend"], true);
    }

    #[test]
    fn active_cron_keeps_schedule_and_policy() {
        let mut graph = ResourceGraph::new();
        let r = create_cron_job(&mut graph, &managed(), &cron("*/10 * * * *", false)).unwrap();
        let spec = &graph.get(r.id()).unwrap().body["spec"];
        assert_eq!(spec["schedule"], "*/10 * * * *");
        assert_eq!(spec["concurrencyPolicy"], "Forbid");
        let pod = &spec["jobTemplate"]["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        assert!(pod.get("tolerations").is_some());
    }

    #[test]
    fn adhoc_cron_has_no_spot_scheduling() {
        let mut graph = ResourceGraph::new();
        let r = create_cron_job(&mut graph, &adhoc(), &cron("0 * * * *", false)).unwrap();
        let pod = &graph.get(r.id()).unwrap().body["spec"]["jobTemplate"]["spec"]["template"]["spec"];
        assert!(pod.get("tolerations").is_none());
        assert!(pod.get("affinity").is_none());
    }
}

//! Suite orchestration
//!
//! Each target gets the same pass, in order:
//!
//! 1. workload identity (binding on the primary only)
//! 2. suite secrets, additional secrets, and in adhoc the dotenv secret
//! 3. migrations (primary only)
//! 4. CDC dependencies and server (primary only)
//! 5. apps
//! 6. crons
//!
//! Every declaration after step 2 waits for the accumulated dependency list,
//! and every pod template carries the secret checksums so a content change
//! rolls the pods.

use std::collections::BTreeMap;

use keel_cdc::{
    create_debezium_dependencies, deploy_debezium, DebeziumDependencies,
    DebeziumDependencyOptions, DebeziumHandle, DebeziumOptions,
};
use keel_common::dotenv::read_dotenv;
use keel_common::hash::content_hash;
use keel_common::naming::{merge_labels, suite_labels};
use keel_common::{
    DeployContext, ResourceGraph, ResourceRef, Result, ANNOTATION_DOTENV_CHECKSUM,
    ANNOTATION_SECRETS_CHECKSUM,
};
use keel_gcp::CloudServiceAccount;
use keel_workload::{
    bind_workload_identity, compile_app, create_cron_job, create_migration_job, create_secret,
    AppHandle, AppOptions, ContainerOptions, CronOptions, MigrationJobOptions, SecretOptions,
    SecretRef, WorkloadIdentity, WorkloadIdentityOptions,
};
use tracing::{debug, info};

use crate::descriptor::SuiteDescriptor;
use crate::target::{validate_targets, DeployTarget};

/// What one target received
#[derive(Clone, Debug)]
pub struct TargetDeployment {
    /// Target name
    pub target: String,
    /// Whether this target owned the side effects
    pub primary: bool,
    /// Identity the suite runs as
    pub identity: WorkloadIdentity,
    /// Suite, additional and dotenv secrets
    pub secrets: Vec<SecretRef>,
    /// Migration jobs
    pub migrations: Vec<ResourceRef>,
    /// CDC dependencies, when declared
    pub cdc_dependencies: Option<DebeziumDependencies>,
    /// CDC server, when deployed
    pub cdc: Option<DebeziumHandle>,
    /// One handle per app
    pub apps: Vec<AppHandle>,
    /// CronJobs
    pub crons: Vec<ResourceRef>,
    /// Checksum annotations placed on every pod template
    pub pod_annotations: BTreeMap<String, String>,
}

/// Result of [`deploy_app_suite`]
#[derive(Clone, Debug)]
pub struct SuiteDeployment {
    /// Suite name
    pub suite: String,
    /// Per-target results, in target order
    pub targets: Vec<TargetDeployment>,
}

impl SuiteDeployment {
    /// Result for a target
    pub fn target(&self, name: &str) -> Option<&TargetDeployment> {
        self.targets.iter().find(|t| t.target == name)
    }

    /// The primary target's result
    pub fn primary(&self) -> Option<&TargetDeployment> {
        self.targets.iter().find(|t| t.primary)
    }

    /// App handles across all targets
    pub fn apps(&self) -> impl Iterator<Item = &AppHandle> {
        self.targets.iter().flat_map(|t| t.apps.iter())
    }
}

/// Deploy a suite to every target
pub fn deploy_app_suite(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    suite: &SuiteDescriptor,
    targets: &[DeployTarget],
) -> Result<SuiteDeployment> {
    validate_targets(ctx, targets)?;

    let mut deployed = Vec::with_capacity(targets.len());
    for target in targets {
        let target_ctx = ctx.for_target(&target.name);
        deployed.push(deploy_to_target(graph, &target_ctx, suite, target)?);
    }

    info!(
        suite = %suite.name,
        targets = deployed.len(),
        "suite deployed"
    );
    Ok(SuiteDeployment {
        suite: suite.name.clone(),
        targets: deployed,
    })
}

/// Secrets of step 2 and what they contribute to pods
struct SuiteSecrets {
    secrets: Vec<SecretRef>,
    annotations: BTreeMap<String, String>,
}

impl SuiteSecrets {
    fn names(&self) -> Vec<String> {
        self.secrets.iter().map(|s| s.name.clone()).collect()
    }
}

fn declare_secrets(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    suite: &SuiteDescriptor,
    deps: &mut Vec<ResourceRef>,
) -> Result<SuiteSecrets> {
    let mut secrets = Vec::new();
    let mut annotations = BTreeMap::new();

    if !suite.secrets.is_empty() {
        let secret = create_secret(
            graph,
            ctx,
            &SecretOptions {
                name: format!("{}-secrets", suite.name),
                namespace: suite.namespace.clone(),
                data: suite.secrets.clone(),
                env_keys: true,
                labels: suite_labels(&suite.name, "secrets"),
                depends_on: deps.clone(),
            },
        )?;
        deps.push(secret.resource.clone());
        secrets.push(secret);
    }

    for (key, data) in &suite.additional_secrets {
        let secret = create_secret(
            graph,
            ctx,
            &SecretOptions {
                name: format!("{}-{}", suite.name, key),
                namespace: suite.namespace.clone(),
                data: data.clone(),
                env_keys: true,
                labels: suite_labels(&suite.name, "secrets"),
                depends_on: deps.clone(),
            },
        )?;
        deps.push(secret.resource.clone());
        secrets.push(secret);
    }

    if !secrets.is_empty() {
        let combined: Vec<&str> = secrets.iter().map(|s| s.checksum.as_str()).collect();
        annotations.insert(
            ANNOTATION_SECRETS_CHECKSUM.to_string(),
            content_hash(combined.join(",").as_bytes()),
        );
    }

    if ctx.is_adhoc() {
        let path = suite.dotenv_path();
        match read_dotenv(&path)? {
            Some(file) => {
                let secret = create_secret(
                    graph,
                    ctx,
                    &SecretOptions {
                        name: format!("{}-dotenv", suite.name),
                        namespace: suite.namespace.clone(),
                        data: file.values,
                        env_keys: false,
                        labels: suite_labels(&suite.name, "dotenv"),
                        depends_on: deps.clone(),
                    },
                )?;
                annotations.insert(ANNOTATION_DOTENV_CHECKSUM.to_string(), file.checksum);
                deps.push(secret.resource.clone());
                secrets.push(secret);
            }
            None => debug!(path = %path.display(), "no dotenv file for adhoc suite"),
        }
    }

    Ok(SuiteSecrets {
        secrets,
        annotations,
    })
}

fn deploy_to_target(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    suite: &SuiteDescriptor,
    target: &DeployTarget,
) -> Result<TargetDeployment> {
    let image = suite.image_ref();

    // 1. identity
    let identity = bind_workload_identity(
        graph,
        ctx,
        &WorkloadIdentityOptions {
            name: suite.name.clone(),
            namespace: suite.namespace.clone(),
            account: suite
                .service_account
                .as_deref()
                .map(CloudServiceAccount::existing),
            bind: target.primary,
        },
    )?;
    let service_account = identity.service_account_name().map(str::to_string);
    let mut deps = identity.dependencies();

    // 2. secrets
    let secrets = declare_secrets(graph, ctx, suite, &mut deps)?;
    let env_from_secrets = secrets.names();

    let container = |command: &Option<Vec<String>>,
                     args: &Option<Vec<String>>,
                     env: &BTreeMap<String, String>,
                     resources: &keel_workload::Resources| ContainerOptions {
        image: image.clone(),
        command: command.clone(),
        args: args.clone(),
        env: merge_labels([&suite.env, env]),
        env_from_secrets: env_from_secrets.clone(),
        resources: resources.clone(),
    };

    // 3. migrations
    let mut migrations = Vec::new();
    if target.primary {
        if let Some(descriptors) = &suite.migrations {
            for (base_name, migration) in descriptors.entries(&suite.name) {
                let job = create_migration_job(
                    graph,
                    ctx,
                    &MigrationJobOptions {
                        base_name,
                        namespace: suite.namespace.clone(),
                        container: container(
                            &Some(migration.command.clone()),
                            &migration.args,
                            &migration.env,
                            &migration.resources,
                        ),
                        service_account: service_account.clone(),
                        backoff_limit: migration.backoff_limit,
                        labels: suite_labels(&suite.name, "migration"),
                        pod_annotations: secrets.annotations.clone(),
                        node_pool: suite.node_pool.clone(),
                        depends_on: deps.clone(),
                        ..Default::default()
                    },
                )?;
                migrations.push(job);
            }
        }
    }
    deps.extend(migrations.iter().cloned());

    // 4. CDC
    let mut cdc_dependencies = None;
    let mut cdc = None;
    if let (true, Some(descriptor)) = (target.primary, &suite.cdc) {
        let dependencies = create_debezium_dependencies(
            graph,
            ctx,
            &DebeziumDependencyOptions {
                name: suite.name.clone(),
                topic: descriptor.topic.clone(),
            },
        )?;
        if descriptor.dependencies_only {
            debug!(suite = %suite.name, "cdc dependencies only");
        } else {
            cdc = Some(deploy_debezium(
                graph,
                ctx,
                &DebeziumOptions {
                    name: suite.name.clone(),
                    namespace: suite.namespace.clone(),
                    descriptor: descriptor.clone(),
                    dependencies: dependencies.clone(),
                    node_pool: suite.node_pool.clone(),
                    labels: BTreeMap::new(),
                    depends_on: deps.clone(),
                },
            )?);
        }
        cdc_dependencies = Some(dependencies);
    }

    // 5. apps
    let mut apps = Vec::with_capacity(suite.apps.len());
    for app in &suite.apps {
        let handle = compile_app(
            graph,
            ctx,
            &AppOptions {
                name: format!("{}-{}", suite.name, app.name),
                namespace: suite.namespace.clone(),
                container: container(&app.command, &app.args, &app.env, &app.resources),
                replicas: app.replicas,
                metrics: app.metrics.clone(),
                ports: app.ports.clone(),
                service: app.service.clone(),
                termination_delay_seconds: app.termination_delay_seconds,
                spot: app.spot.unwrap_or(suite.spot),
                node_pool: app.node_pool.clone().or_else(|| suite.node_pool.clone()),
                labels: suite_labels(&suite.name, &app.name),
                pod_annotations: secrets.annotations.clone(),
                service_account: service_account.clone(),
                depends_on: deps.clone(),
            },
        )?;
        apps.push(handle);
    }

    // 6. crons
    let mut crons = Vec::with_capacity(suite.crons.len());
    for cron in &suite.crons {
        let job = create_cron_job(
            graph,
            ctx,
            &CronOptions {
                name: format!("{}-{}", suite.name, cron.name),
                namespace: suite.namespace.clone(),
                schedule: cron.schedule.clone(),
                suspend: cron.suspend,
                concurrency_policy: cron.concurrency_policy,
                container: container(&cron.command, &cron.args, &cron.env, &cron.resources),
                service_account: service_account.clone(),
                backoff_limit: cron.backoff_limit,
                spot: cron.spot.unwrap_or(suite.spot),
                node_pool: suite.node_pool.clone(),
                labels: suite_labels(&suite.name, &cron.name),
                pod_annotations: secrets.annotations.clone(),
                depends_on: deps.clone(),
            },
        )?;
        crons.push(job);
    }

    info!(
        suite = %suite.name,
        namespace = %suite.namespace,
        target = %target.name,
        primary = target.primary,
        apps = apps.len(),
        crons = crons.len(),
        migrations = migrations.len(),
        cdc = cdc.is_some(),
        "suite deployed to target"
    );
    Ok(TargetDeployment {
        target: target.name.clone(),
        primary: target.primary,
        identity,
        secrets: secrets.secrets,
        migrations,
        cdc_dependencies,
        cdc,
        apps,
        crons,
        pod_annotations: secrets.annotations,
    })
}

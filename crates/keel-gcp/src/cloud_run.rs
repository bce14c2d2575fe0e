//! Cloud Run services

use std::collections::BTreeMap;

use keel_common::config::StackReference;
use keel_common::naming::camel_to_underscore;
use keel_common::{Backend, DeployContext, ResourceGraph, ResourceRef, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::iam::push_invoker_email;
use crate::secret_manager::SecretHandle;

/// Cloud Run service
pub const KIND_SERVICE: &str = "gcp:cloudrun:Service";
/// Cloud Run invoker IAM member
pub const KIND_INVOKER: &str = "gcp:cloudrun:IamMember";

/// Serverless VPC access connector annotation
pub const ANNOTATION_VPC_CONNECTOR: &str = "run.googleapis.com/vpc-access-connector";
/// VPC egress annotation
pub const ANNOTATION_VPC_EGRESS: &str = "run.googleapis.com/vpc-access-egress";
/// Minimum instance count annotation
pub const ANNOTATION_MIN_SCALE: &str = "autoscaling.knative.dev/minScale";
/// Maximum instance count annotation
pub const ANNOTATION_MAX_SCALE: &str = "autoscaling.knative.dev/maxScale";

const EGRESS_PRIVATE_RANGES: &str = "private-ranges-only";
const INVOKER_ROLE: &str = "roles/run.invoker";

/// Who may invoke the service
#[derive(Clone, Debug, PartialEq)]
pub enum InvokerAccess {
    /// Anyone (`allUsers`)
    Public,
    /// A single push identity (service account email)
    PushIdentity(String),
}

impl InvokerAccess {
    /// IAM member for this access mode
    pub fn member(&self) -> String {
        match self {
            InvokerAccess::Public => "allUsers".to_string(),
            InvokerAccess::PushIdentity(email) => format!("serviceAccount:{}", email),
        }
    }

    /// Push identity shared by another stack
    pub fn from_stack(stack: &StackReference) -> Result<Self> {
        Ok(InvokerAccess::PushIdentity(push_invoker_email(stack)?))
    }
}

/// Options for [`create_service`]
#[derive(Clone, Debug, Default)]
pub struct CloudRunOptions {
    /// Service name
    pub name: String,
    /// Container image
    pub image: String,
    /// Container port
    pub port: Option<u16>,
    /// Plain environment variables
    pub env: BTreeMap<String, String>,
    /// Secret-backed environment variables
    pub secrets: Vec<SecretHandle>,
    /// Runtime service account email
    pub service_account: Option<String>,
    /// Extra template annotations. Platform annotations win on collision.
    pub annotations: BTreeMap<String, String>,
    /// Minimum instance count
    pub min_instances: Option<u32>,
    /// Maximum instance count
    pub max_instances: Option<u32>,
    /// Requests per container
    pub concurrency: Option<u32>,
    /// CPU limit (e.g. `1000m`)
    pub cpu: Option<String>,
    /// Memory limit (e.g. `512Mi`)
    pub memory: Option<String>,
    /// VPC connector; defaults to the regional `default` connector
    pub vpc_connector: Option<String>,
    /// Invoker access mode
    pub access: Option<InvokerAccess>,
    /// Name of the invoker binding
    pub binding_name: Option<String>,
    /// Extra dependencies
    pub depends_on: Vec<ResourceRef>,
}

/// A declared Cloud Run service
#[derive(Clone, Debug)]
pub struct CloudRunHandle {
    /// Service declaration
    pub service: ResourceRef,
    /// Output token for the service URL
    pub url: String,
    /// Invoker binding, when declared
    pub invoker: Option<ResourceRef>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceBody<'a> {
    name: &'a str,
    location: &'a str,
    project: &'a str,
    template: Template<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Template<'a> {
    metadata: TemplateMeta,
    spec: TemplateSpec<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateMeta {
    annotations: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateSpec<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    service_account_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    container_concurrency: Option<u32>,
    containers: Vec<Container<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Container<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<ContainerPort>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    envs: Vec<EnvVar>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    resources: BTreeMap<&'static str, BTreeMap<&'static str, String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvVar {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_from: Option<EnvSource>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvSource {
    secret_key_ref: SecretKeyRef,
}

#[derive(Serialize)]
struct SecretKeyRef {
    name: String,
    key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokerBody<'a> {
    service: String,
    location: &'a str,
    project: &'a str,
    role: &'static str,
    member: String,
}

fn template_annotations(ctx: &DeployContext, opts: &CloudRunOptions) -> BTreeMap<String, String> {
    let mut annotations = opts.annotations.clone();
    if let Some(max) = opts.max_instances {
        annotations.insert(ANNOTATION_MAX_SCALE.to_string(), max.to_string());
    }
    if ctx.is_adhoc() {
        return annotations;
    }

    let connector = opts.vpc_connector.clone().unwrap_or_else(|| {
        format!(
            "projects/{}/locations/{}/connectors/default",
            ctx.project, ctx.region
        )
    });
    annotations.insert(ANNOTATION_VPC_CONNECTOR.to_string(), connector);
    annotations.insert(
        ANNOTATION_VPC_EGRESS.to_string(),
        EGRESS_PRIVATE_RANGES.to_string(),
    );
    if let Some(min) = opts.min_instances {
        annotations.insert(ANNOTATION_MIN_SCALE.to_string(), min.to_string());
    }
    annotations
}

fn container_env(opts: &CloudRunOptions) -> Vec<EnvVar> {
    let plain = opts.env.iter().map(|(k, v)| EnvVar {
        name: k.clone(),
        value: Some(v.clone()),
        value_from: None,
    });
    let secret = opts.secrets.iter().map(|s| EnvVar {
        name: camel_to_underscore(&s.key),
        value: None,
        value_from: Some(EnvSource {
            secret_key_ref: SecretKeyRef {
                name: s.secret_id.clone(),
                key: s
                    .reference
                    .rsplit_once(':')
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_else(|| "latest".to_string()),
            },
        }),
    });
    plain.chain(secret).collect()
}

/// Declare a Cloud Run service and, when fully specified, its invoker binding
pub fn create_service(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &CloudRunOptions,
) -> Result<CloudRunHandle> {
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &opts.cpu {
        limits.insert("cpu", cpu.clone());
    }
    if let Some(memory) = &opts.memory {
        limits.insert("memory", memory.clone());
    }
    let mut resources = BTreeMap::new();
    if !limits.is_empty() {
        resources.insert("limits", limits);
    }

    let mut deps = opts.depends_on.clone();
    deps.extend(opts.secrets.iter().map(|s| s.version.clone()));

    let service = graph.register(
        ctx.cloud_id(KIND_SERVICE, &opts.name),
        Backend::Managed,
        &ServiceBody {
            name: &opts.name,
            location: &ctx.region,
            project: &ctx.project,
            template: Template {
                metadata: TemplateMeta {
                    annotations: template_annotations(ctx, opts),
                },
                spec: TemplateSpec {
                    service_account_name: opts.service_account.as_deref(),
                    container_concurrency: opts.concurrency,
                    containers: vec![Container {
                        image: &opts.image,
                        ports: opts
                            .port
                            .map(|p| vec![ContainerPort { container_port: p }])
                            .unwrap_or_default(),
                        envs: container_env(opts),
                        resources,
                    }],
                },
            },
        },
        &deps,
    )?;

    let invoker = match (&opts.access, &opts.binding_name) {
        (Some(access), Some(binding_name)) => Some(graph.register(
            ctx.cloud_id(KIND_INVOKER, binding_name),
            Backend::Managed,
            &InvokerBody {
                service: service.output("name"),
                location: &ctx.region,
                project: &ctx.project,
                role: INVOKER_ROLE,
                member: access.member(),
            },
            &[service.clone()],
        )?),
        _ => {
            debug!(service = %opts.name, "invoker binding not fully specified, skipping");
            None
        }
    };

    info!(
        service = %opts.name,
        invoker = invoker.is_some(),
        "declared cloud run service"
    );
    Ok(CloudRunHandle {
        url: service.output("status.url"),
        service,
        invoker,
    })
}

//! App compilation
//!
//! An app always becomes a Deployment. Managed environments add a
//! HorizontalPodAutoscaler and a PodDisruptionBudget. A Service is declared
//! when the caller asks for one or lists ports, with a GKE BackendConfig
//! when CDN or a backend timeout is requested.

use std::collections::BTreeMap;

use keel_common::{Backend, DeployContext, Error, ObjectMeta, ResourceGraph, ResourceRef, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::k8s::{
    BackendConfig, BackendConfigSpec, CdnConfig, ContainerPort, Deployment, DeploymentSpec,
    DeploymentStrategy, ExecAction, HorizontalPodAutoscaler, HpaSpec, LabelSelector, Lifecycle,
    LifecycleHandler, MetricSpec, MetricTarget, PdbSpec, PodDisruptionBudget,
    ResourceMetricSource, ScaleTargetRef, Service, ServicePort, ServiceSpec, KIND_BACKEND_CONFIG,
    KIND_DEPLOYMENT, KIND_HPA, KIND_PDB, KIND_SERVICE,
};
use crate::pod::{pod_template, ContainerOptions, PodOptions};
use crate::spot::{self, SpotPolicy};

/// Service annotation linking a BackendConfig
pub const ANNOTATION_BACKEND_CONFIG: &str = "cloud.google.com/backend-config";
/// Service annotation enabling container-native load balancing
pub const ANNOTATION_NEG: &str = "cloud.google.com/neg";

/// Seconds added to the preStop delay for the termination grace period
const GRACE_PERIOD_MARGIN: u32 = 30;
const DEFAULT_CPU_TARGET: u32 = 80;
const DEFAULT_SERVICE_PORT: u16 = 80;
const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// Replica bounds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replicas {
    /// Minimum
    pub min: u32,
    /// Maximum
    pub max: u32,
}

impl Default for Replicas {
    fn default() -> Self {
        Self { min: 1, max: 3 }
    }
}

/// Resource metric the autoscaler tracks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingMetric {
    /// `cpu` or `memory`
    pub resource: String,
    /// Target average utilization in percent
    pub target_utilization: u32,
}

/// Service port
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port name
    pub name: String,
    /// Service port
    pub port: u16,
    /// Container port; defaults to `port`
    #[serde(default)]
    pub target_port: Option<u16>,
}

/// Network exposure
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOptions {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    pub service_type: Option<String>,
    /// Enable Cloud CDN
    pub cdn: bool,
    /// Backend timeout in seconds
    pub timeout_sec: Option<u32>,
}

/// Options for [`compile_app`]
#[derive(Clone, Debug, Default)]
pub struct AppOptions {
    /// App name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Main container
    pub container: ContainerOptions,
    /// Replica bounds
    pub replicas: Replicas,
    /// Autoscaling metrics; CPU at 80% when empty
    pub metrics: Vec<AutoscalingMetric>,
    /// Explicit service ports
    pub ports: Vec<PortSpec>,
    /// Requested service
    pub service: Option<ServiceOptions>,
    /// Seconds to sleep in preStop before shutdown
    pub termination_delay_seconds: Option<u32>,
    /// Spot scheduling intent
    pub spot: SpotPolicy,
    /// GKE node pool
    pub node_pool: Option<String>,
    /// Extra labels
    pub labels: BTreeMap<String, String>,
    /// Pod annotations
    pub pod_annotations: BTreeMap<String, String>,
    /// KSA name
    pub service_account: Option<String>,
    /// Declarations the deployment waits for
    pub depends_on: Vec<ResourceRef>,
}

/// Declarations made for one app
#[derive(Clone, Debug)]
pub struct AppHandle {
    /// App name
    pub name: String,
    /// Deployment
    pub deployment: ResourceRef,
    /// Autoscaler (managed only)
    pub autoscaler: Option<ResourceRef>,
    /// Disruption budget (managed only)
    pub pdb: Option<ResourceRef>,
    /// Service, when exposed
    pub service: Option<ResourceRef>,
    /// BackendConfig, when CDN or timeout requested
    pub backend_config: Option<ResourceRef>,
}

impl AppHandle {
    /// Every declaration of the app
    pub fn resources(&self) -> Vec<&ResourceRef> {
        std::iter::once(&self.deployment)
            .chain(self.autoscaler.iter())
            .chain(self.pdb.iter())
            .chain(self.service.iter())
            .chain(self.backend_config.iter())
            .collect()
    }
}

fn validate(opts: &AppOptions) -> Result<()> {
    if opts.replicas.min > opts.replicas.max {
        return Err(Error::config(
            "app",
            format!(
                "app '{}': min replicas {} exceeds max replicas {}",
                opts.name, opts.replicas.min, opts.replicas.max
            ),
        ));
    }
    for metric in &opts.metrics {
        if !matches!(metric.resource.as_str(), "cpu" | "memory") {
            return Err(Error::config(
                "app",
                format!(
                    "app '{}': unsupported autoscaling resource '{}'",
                    opts.name, metric.resource
                ),
            ));
        }
    }
    if let Some(delay) = opts.termination_delay_seconds {
        if delay.checked_add(GRACE_PERIOD_MARGIN).is_none() {
            return Err(Error::config(
                "app",
                format!(
                    "app '{}': termination delay {}s is too large",
                    opts.name, delay
                ),
            ));
        }
    }
    Ok(())
}

fn service_ports(opts: &AppOptions) -> Vec<PortSpec> {
    if opts.ports.is_empty() {
        vec![PortSpec {
            name: "http".to_string(),
            port: DEFAULT_SERVICE_PORT,
            target_port: Some(DEFAULT_CONTAINER_PORT),
        }]
    } else {
        opts.ports.clone()
    }
}

fn build_deployment(ctx: &DeployContext, opts: &AppOptions, exposed: bool) -> Deployment {
    let mut container = opts.container.to_container(&opts.name);
    if exposed {
        container.ports = service_ports(opts)
            .into_iter()
            .map(|p| ContainerPort {
                name: Some(p.name),
                container_port: p.target_port.unwrap_or(p.port),
            })
            .collect();
    }
    if let Some(delay) = opts.termination_delay_seconds {
        container.lifecycle = Some(Lifecycle {
            pre_stop: LifecycleHandler {
                exec: ExecAction {
                    command: vec!["sleep".to_string(), delay.to_string()],
                },
            },
        });
    }

    let pod = PodOptions {
        labels: opts.labels.clone(),
        annotations: opts.pod_annotations.clone(),
        service_account: opts.service_account.clone(),
        spot: spot::compute(&opts.spot, ctx.environment),
        node_pool: opts.node_pool.clone(),
    };
    let mut template = pod_template(&opts.name, &pod, vec![container]);
    template.spec.termination_grace_period_seconds = opts
        .termination_delay_seconds
        .map(|delay| delay.saturating_add(GRACE_PERIOD_MARGIN));

    Deployment {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        metadata: ObjectMeta::new(&opts.name, &opts.namespace).with_labels(&opts.labels),
        spec: DeploymentSpec {
            // the autoscaler owns the replica count in managed environments
            replicas: ctx.is_adhoc().then_some(opts.replicas.min),
            selector: LabelSelector::for_name(&opts.name),
            template,
            strategy: Some(DeploymentStrategy {
                type_: "RollingUpdate".to_string(),
            }),
        },
    }
}

fn build_hpa(opts: &AppOptions) -> HorizontalPodAutoscaler {
    let metrics = if opts.metrics.is_empty() {
        vec![AutoscalingMetric {
            resource: "cpu".to_string(),
            target_utilization: DEFAULT_CPU_TARGET,
        }]
    } else {
        opts.metrics.clone()
    };

    HorizontalPodAutoscaler {
        api_version: "autoscaling/v2".to_string(),
        kind: "HorizontalPodAutoscaler".to_string(),
        metadata: ObjectMeta::new(&opts.name, &opts.namespace),
        spec: HpaSpec {
            scale_target_ref: ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: opts.name.clone(),
            },
            min_replicas: opts.replicas.min,
            max_replicas: opts.replicas.max,
            metrics: metrics
                .into_iter()
                .map(|m| MetricSpec {
                    type_: "Resource".to_string(),
                    resource: ResourceMetricSource {
                        name: m.resource,
                        target: MetricTarget {
                            type_: "Utilization".to_string(),
                            average_utilization: m.target_utilization,
                        },
                    },
                })
                .collect(),
        },
    }
}

fn build_pdb(opts: &AppOptions) -> PodDisruptionBudget {
    PodDisruptionBudget {
        api_version: "policy/v1".to_string(),
        kind: "PodDisruptionBudget".to_string(),
        metadata: ObjectMeta::new(&opts.name, &opts.namespace),
        spec: PdbSpec {
            max_unavailable: 1,
            selector: LabelSelector::for_name(&opts.name),
        },
    }
}

fn build_service(ctx: &DeployContext, opts: &AppOptions, backend_config: Option<&str>) -> Service {
    let mut metadata = ObjectMeta::new(&opts.name, &opts.namespace).with_labels(&opts.labels);
    if !ctx.is_adhoc() {
        metadata = metadata.with_annotation(ANNOTATION_NEG, r#"{"ingress": true}"#);
    }
    if let Some(name) = backend_config {
        metadata = metadata.with_annotation(
            ANNOTATION_BACKEND_CONFIG,
            serde_json::json!({ "default": name }).to_string(),
        );
    }

    Service {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        metadata,
        spec: ServiceSpec {
            selector: LabelSelector::for_name(&opts.name).match_labels,
            ports: service_ports(opts)
                .into_iter()
                .map(|p| ServicePort {
                    name: Some(p.name),
                    port: p.port,
                    target_port: p.target_port,
                    protocol: Some("TCP".to_string()),
                })
                .collect(),
            type_: opts.service.as_ref().and_then(|s| s.service_type.clone()),
        },
    }
}

/// Compile an app into its Kubernetes declarations
pub fn compile_app(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &AppOptions,
) -> Result<AppHandle> {
    validate(opts)?;

    let exposed = opts.service.is_some() || !opts.ports.is_empty();
    let deployment = graph.register(
        ctx.cluster_id(KIND_DEPLOYMENT, &opts.namespace, &opts.name),
        Backend::Managed,
        &build_deployment(ctx, opts, exposed),
        &opts.depends_on,
    )?;

    let (autoscaler, pdb) = if ctx.is_adhoc() {
        (None, None)
    } else {
        let hpa = graph.register(
            ctx.cluster_id(KIND_HPA, &opts.namespace, &opts.name),
            Backend::Managed,
            &build_hpa(opts),
            &[deployment.clone()],
        )?;
        let pdb = graph.register(
            ctx.cluster_id(KIND_PDB, &opts.namespace, &opts.name),
            Backend::Managed,
            &build_pdb(opts),
            &[deployment.clone()],
        )?;
        (Some(hpa), Some(pdb))
    };

    let backend_config = match &opts.service {
        Some(svc) if exposed && (svc.cdn || svc.timeout_sec.is_some()) => {
            let config = BackendConfig {
                api_version: "cloud.google.com/v1".to_string(),
                kind: "BackendConfig".to_string(),
                metadata: ObjectMeta::new(&opts.name, &opts.namespace),
                spec: BackendConfigSpec {
                    timeout_sec: svc.timeout_sec,
                    cdn: svc.cdn.then_some(CdnConfig { enabled: true }),
                },
            };
            Some(graph.register(
                ctx.cluster_id(KIND_BACKEND_CONFIG, &opts.namespace, &opts.name),
                Backend::Managed,
                &config,
                &[],
            )?)
        }
        _ => None,
    };

    let service = if exposed {
        let mut deps = opts.depends_on.clone();
        deps.push(deployment.clone());
        deps.extend(backend_config.iter().cloned());
        Some(graph.register(
            ctx.cluster_id(KIND_SERVICE, &opts.namespace, &opts.name),
            Backend::Managed,
            &build_service(ctx, opts, backend_config.as_ref().map(|_| opts.name.as_str())),
            &deps,
        )?)
    } else {
        None
    };

    info!(
        name = %opts.name,
        namespace = %opts.namespace,
        target = ?ctx.target,
        autoscaled = autoscaler.is_some(),
        exposed,
        "compiled app"
    );

    Ok(AppHandle {
        name: opts.name.clone(),
        deployment,
        autoscaler,
        pdb,
        service,
        backend_config,
    })
}

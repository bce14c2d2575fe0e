//! Redis Helm releases
//!
//! Values are computed here; chart rendering is left to the engine's Helm
//! provider.

use std::collections::BTreeMap;

use keel_common::naming::node_labels;
use keel_common::{Backend, DeployContext, Error, ResourceGraph, ResourceRef, Result};
use keel_workload::spot::{self, SpotPolicy};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::{build_configuration, ConfigurationOptions};
use crate::sizing::{configure_persistence, memory_limit, memory_request, SizingOptions};

/// Helm release declaration kind
pub const KIND_HELM_RELEASE: &str = "kubernetes:helm.sh/v3:Release";

const BITNAMI_REPO: &str = "https://charts.bitnami.com/bitnami";
const REDIS_PORT: u16 = 6379;
const SENTINEL_PORT: u16 = 26379;

/// Deployment topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedisArchitecture {
    /// Primary with read replicas; standalone when `replicas == 0`
    Replication {
        /// Read replicas
        replicas: u32,
    },
    /// Sharded cluster
    Cluster {
        /// Primary shards
        shards: u32,
        /// Replicas per shard
        replicas_per_shard: u32,
    },
    /// Replication with sentinel failover
    Sentinel {
        /// Replicas (sentinel runs alongside each)
        replicas: u32,
        /// Sentinels needed to agree on failover
        quorum: u32,
    },
}

impl Default for RedisArchitecture {
    fn default() -> Self {
        RedisArchitecture::Replication { replicas: 0 }
    }
}

impl RedisArchitecture {
    fn chart(self) -> &'static str {
        match self {
            RedisArchitecture::Cluster { .. } => "redis-cluster",
            _ => "redis",
        }
    }

    /// Total cluster nodes: every shard's primary plus its replicas
    fn cluster_nodes(shards: u32, replicas_per_shard: u32) -> Result<u32> {
        replicas_per_shard
            .checked_add(1)
            .and_then(|per_shard| shards.checked_mul(per_shard))
            .ok_or_else(|| {
                Error::config(
                    "redis",
                    format!(
                        "redis cluster of {} shards with {} replicas each is too large",
                        shards, replicas_per_shard
                    ),
                )
            })
    }

    fn validate(self) -> Result<()> {
        match self {
            RedisArchitecture::Cluster { shards, .. } if shards < 3 => Err(Error::config(
                "redis",
                format!("redis cluster needs at least 3 shards, got {}", shards),
            )),
            RedisArchitecture::Cluster {
                shards,
                replicas_per_shard,
            } => Self::cluster_nodes(shards, replicas_per_shard).map(|_| ()),
            RedisArchitecture::Sentinel { replicas, quorum } if quorum == 0 || quorum > replicas => {
                Err(Error::config(
                    "redis",
                    format!(
                        "sentinel quorum {} must be within 1..={} replicas",
                        quorum, replicas
                    ),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Options for [`create_redis`]
#[derive(Clone, Debug, Default)]
pub struct RedisOptions {
    /// Release name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Topology
    pub architecture: RedisArchitecture,
    /// Requested memory in GiB
    pub memory_size_gb: f64,
    /// Explicit storage in GiB
    pub storage_size_gb: Option<u32>,
    /// Extra redis.conf directives
    pub configuration: BTreeMap<String, String>,
    /// Module paths
    pub modules: Vec<String>,
    /// Share of memory for `maxmemory`
    pub maxmemory_percent: Option<u32>,
    /// Chart version
    pub chart_version: Option<String>,
    /// Existing secret holding the password
    pub password_secret: Option<String>,
    /// Image override (e.g. a redis-stack image carrying the modules)
    pub image: Option<String>,
    /// Spot scheduling
    pub spot: SpotPolicy,
    /// GKE node pool
    pub node_pool: Option<String>,
    /// Dependencies
    pub depends_on: Vec<ResourceRef>,
}

/// A declared Redis release
#[derive(Clone, Debug)]
pub struct RedisHandle {
    /// Release declaration
    pub release: ResourceRef,
    /// In-cluster host clients connect to
    pub host: String,
    /// Port clients connect to
    pub port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseBody<'a> {
    name: &'a str,
    namespace: &'a str,
    chart: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    repository_opts: RepositoryOpts,
    values: Value,
}

#[derive(Serialize)]
struct RepositoryOpts {
    repo: &'static str,
}

fn pod_values(ctx: &DeployContext, opts: &RedisOptions, persistence: &Value) -> Result<Value> {
    let scheduling = spot::compute(&opts.spot, ctx.environment);
    let mut values = json!({
        "resources": {
            "requests": { "memory": memory_request(opts.memory_size_gb) },
            "limits": { "memory": memory_limit(opts.memory_size_gb) },
        },
        "persistence": persistence,
    });
    if !scheduling.tolerations.is_empty() {
        values["tolerations"] = serde_json::to_value(&scheduling.tolerations)?;
    }
    if let Some(affinity) = &scheduling.affinity {
        values["affinity"] = serde_json::to_value(affinity)?;
    }
    if let Some(pool) = &opts.node_pool {
        values["nodeSelector"] = serde_json::to_value(node_labels(pool))?;
    }
    Ok(values)
}

fn auth_values(opts: &RedisOptions) -> Value {
    match &opts.password_secret {
        Some(secret) => json!({ "enabled": true, "existingSecret": secret }),
        None => json!({ "enabled": false }),
    }
}

fn image_values(opts: &RedisOptions) -> Option<Value> {
    let image = opts.image.as_ref()?;
    let (repository, tag) = image.rsplit_once(':').unwrap_or((image.as_str(), "latest"));
    Some(json!({ "repository": repository, "tag": tag }))
}

fn chart_values(ctx: &DeployContext, opts: &RedisOptions) -> Result<Value> {
    let persistence = serde_json::to_value(configure_persistence(&SizingOptions {
        memory_size_gb: opts.memory_size_gb,
        storage_size_gb: opts.storage_size_gb,
    })?)?;
    let configuration = build_configuration(&ConfigurationOptions {
        configuration: opts.configuration.clone(),
        modules: opts.modules.clone(),
        memory_size_gb: opts.memory_size_gb,
        maxmemory_percent: opts.maxmemory_percent,
    })?;
    let pod = pod_values(ctx, opts, &persistence)?;

    let mut values = match opts.architecture {
        RedisArchitecture::Replication { replicas } => json!({
            "architecture": replication_mode(replicas),
            "auth": auth_values(opts),
            "commonConfiguration": configuration,
            "master": pod,
            "replica": merge(json!({ "replicaCount": replicas }), &pod),
        }),
        RedisArchitecture::Cluster {
            shards,
            replicas_per_shard,
        } => json!({
            "usePassword": opts.password_secret.is_some(),
            "existingSecret": opts.password_secret,
            "cluster": {
                "nodes": RedisArchitecture::cluster_nodes(shards, replicas_per_shard)?,
                "replicas": replicas_per_shard,
            },
            "redis": merge(json!({ "configmap": configuration }), &pod),
            "persistence": persistence,
        }),
        RedisArchitecture::Sentinel { replicas, quorum } => json!({
            "architecture": "replication",
            "auth": auth_values(opts),
            "commonConfiguration": configuration,
            "sentinel": { "enabled": true, "quorum": quorum },
            "replica": merge(json!({ "replicaCount": replicas }), &pod),
        }),
    };
    if let Some(image) = image_values(opts) {
        values["image"] = image;
    }
    Ok(values)
}

fn replication_mode(replicas: u32) -> &'static str {
    if replicas == 0 {
        "standalone"
    } else {
        "replication"
    }
}

fn merge(mut base: Value, extra: &Value) -> Value {
    if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    base
}

fn endpoint(opts: &RedisOptions) -> (String, u16) {
    let suffix = format!("{}.svc.cluster.local", opts.namespace);
    match opts.architecture {
        RedisArchitecture::Replication { .. } => {
            (format!("{}-master.{}", opts.name, suffix), REDIS_PORT)
        }
        RedisArchitecture::Cluster { .. } => (format!("{}.{}", opts.name, suffix), REDIS_PORT),
        RedisArchitecture::Sentinel { .. } => {
            (format!("{}.{}", opts.name, suffix), SENTINEL_PORT)
        }
    }
}

/// Declare a Redis release.
///
/// All sizing and configuration errors are raised before anything is
/// registered.
pub fn create_redis(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &RedisOptions,
) -> Result<RedisHandle> {
    opts.architecture.validate()?;
    let values = chart_values(ctx, opts)?;

    let release = graph.register(
        ctx.cluster_id(KIND_HELM_RELEASE, &opts.namespace, &opts.name),
        Backend::Managed,
        &ReleaseBody {
            name: &opts.name,
            namespace: &opts.namespace,
            chart: opts.architecture.chart(),
            version: opts.chart_version.as_deref(),
            repository_opts: RepositoryOpts { repo: BITNAMI_REPO },
            values,
        },
        &opts.depends_on,
    )?;

    let (host, port) = endpoint(opts);
    info!(
        name = %opts.name,
        namespace = %opts.namespace,
        architecture = ?opts.architecture,
        "declared redis release"
    );
    Ok(RedisHandle {
        release,
        host,
        port,
    })
}

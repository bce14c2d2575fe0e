//! Debezium server deployment
//!
//! The pipeline is split in two: [`create_debezium_dependencies`] declares
//! the publishing identity and its topic, [`deploy_debezium`] declares the
//! single-replica server around them. Offsets live on a dedicated volume so
//! a restart resumes from the last committed position.

use std::collections::BTreeMap;
use std::path::PathBuf;

use keel_common::hash::content_hash;
use keel_common::naming::{merge_labels, suite_labels};
use keel_common::{
    Backend, DeployContext, ObjectMeta, ResourceGraph, ResourceId, ResourceRef, Result,
    ANNOTATION_PROPS_CHECKSUM,
};
use keel_gcp::iam::{create_service_account, ServiceAccountHandle, ServiceAccountOptions};
use keel_gcp::pubsub::{ensure_topic, TopicHandle};
use keel_workload::k8s::{
    ClaimRef, Deployment, DeploymentSpec, DeploymentStrategy, EnvVar, GcePersistentDisk, HostPath,
    LabelSelector, PersistentVolume, PersistentVolumeClaim, PvSpec, PvcResources, PvcSpec,
    PvcStorage, Secret, Volume, VolumeMount, KIND_DEPLOYMENT, KIND_PERSISTENT_VOLUME,
    KIND_PERSISTENT_VOLUME_CLAIM, KIND_SECRET,
};
use keel_workload::pod::{pod_template, ContainerOptions, PodOptions, Resources};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::properties::{load_template, render_properties_strict};

/// Managed persistent disk holding the offsets
pub const KIND_DISK: &str = "gcp:compute:Disk";
/// Debezium server image repository
pub const DEBEZIUM_IMAGE: &str = "quay.io/debezium/server";

const COMPONENT: &str = "cdc";
const PUBSUB_ROLES: [&str; 2] = ["roles/pubsub.publisher", "roles/pubsub.viewer"];
const DEFAULT_STORAGE_GB: u32 = 10;
const PROPERTIES_KEY: &str = "application.properties";
const CREDENTIALS_KEY: &str = "credentials.json";
const CONFIG_MOUNT: &str = "/debezium/conf";
const DATA_MOUNT: &str = "/debezium/data";
const CREDENTIALS_MOUNT: &str = "/var/secrets/google";
const LOCAL_DATA_ROOT: &str = "/var/lib/keel/debezium";

/// CDC section of a suite description
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebeziumDescriptor {
    /// Path to the properties template
    pub properties_template: PathBuf,
    /// Placeholder values
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Topic the server publishes to
    pub topic: String,
    /// Server image tag
    pub version: String,
    /// Declare only the identity and topic
    #[serde(default)]
    pub dependencies_only: bool,
    /// Offset volume size in GiB
    #[serde(default)]
    pub storage_size_gb: Option<u32>,
    /// Server resources
    #[serde(default)]
    pub resources: Resources,
}

/// Options for [`create_debezium_dependencies`]
#[derive(Clone, Debug, Default)]
pub struct DebeziumDependencyOptions {
    /// Pipeline name (usually the suite name)
    pub name: String,
    /// Topic name
    pub topic: String,
}

/// Identity and topic a Debezium server publishes with
#[derive(Clone, Debug)]
pub struct DebeziumDependencies {
    /// Publishing service account, with a key
    pub account: ServiceAccountHandle,
    /// Target topic
    pub topic: TopicHandle,
}

impl DebeziumDependencies {
    /// Every declaration the server must wait for
    pub fn resources(&self) -> Vec<ResourceRef> {
        let mut deps = self.account.dependencies();
        deps.push(self.topic.resource.clone());
        deps
    }
}

/// Options for [`deploy_debezium`]
#[derive(Clone, Debug)]
pub struct DebeziumOptions {
    /// Pipeline name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Template, variables, version and sizing
    pub descriptor: DebeziumDescriptor,
    /// Result of [`create_debezium_dependencies`]
    pub dependencies: DebeziumDependencies,
    /// GKE node pool
    pub node_pool: Option<String>,
    /// Extra labels
    pub labels: BTreeMap<String, String>,
    /// Further dependencies (secrets, migrations)
    pub depends_on: Vec<ResourceRef>,
}

/// Declared Debezium server
#[derive(Clone, Debug)]
pub struct DebeziumHandle {
    /// Server name
    pub name: String,
    /// Deployment
    pub deployment: ResourceRef,
    /// Properties secret
    pub config: ResourceRef,
    /// Credentials secret
    pub credentials: ResourceRef,
    /// Offset volume claim
    pub claim: ResourceRef,
    /// Checksum of the rendered properties
    pub checksum: String,
}

fn server_name(name: &str) -> String {
    format!("{}-debezium", name)
}

fn claim_name(server: &str) -> String {
    format!("{}-offsets", server)
}

fn account_id(name: &str) -> String {
    format!("{}-cdc", name)
}

/// Declare the publishing service account (with key) and the topic
pub fn create_debezium_dependencies(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &DebeziumDependencyOptions,
) -> Result<DebeziumDependencies> {
    let account = create_service_account(
        graph,
        ctx,
        &ServiceAccountOptions {
            account_id: account_id(&opts.name),
            display_name: Some(format!("{} change data capture", opts.name)),
            roles: PUBSUB_ROLES.iter().map(|r| r.to_string()).collect(),
            create_key: true,
        },
    )?;
    let topic = ensure_topic(graph, ctx, &opts.topic)?;

    info!(name = %opts.name, topic = %opts.topic, "declared debezium dependencies");
    Ok(DebeziumDependencies { account, topic })
}

/// Variables every template can use; caller variables override them
fn builtin_vars(ctx: &DeployContext, topic: &TopicHandle) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PROJECT_ID".to_string(), ctx.project.clone()),
        ("TOPIC".to_string(), topic.name.clone()),
        (
            "OFFSET_FILE".to_string(),
            format!("{}/offsets.dat", DATA_MOUNT),
        ),
        (
            "CREDENTIALS_FILE".to_string(),
            format!("{}/{}", CREDENTIALS_MOUNT, CREDENTIALS_KEY),
        ),
    ])
}

fn declare_storage(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    name: &str,
    opts: &DebeziumOptions,
    labels: &BTreeMap<String, String>,
) -> Result<ResourceRef> {
    let size_gb = opts
        .descriptor
        .storage_size_gb
        .unwrap_or(DEFAULT_STORAGE_GB);
    let size = format!("{}Gi", size_gb);
    let volume_name = format!("{}-{}-offsets", opts.namespace, name);

    let mut volume_deps = Vec::new();
    let (gce_persistent_disk, host_path) = match ctx.backend() {
        Backend::Managed => {
            let disk = graph.register(
                ctx.cloud_id(KIND_DISK, &volume_name),
                Backend::Managed,
                &serde_json::json!({
                    "name": volume_name,
                    "project": ctx.project,
                    "zone": format!("{}-a", ctx.region),
                    "size": size_gb,
                    "type": "pd-balanced",
                }),
                &[],
            )?;
            volume_deps.push(disk);
            (
                Some(GcePersistentDisk {
                    pd_name: volume_name.clone(),
                    fs_type: "ext4".to_string(),
                }),
                None,
            )
        }
        Backend::Local => (
            None,
            Some(HostPath {
                path: format!("{}/{}/{}", LOCAL_DATA_ROOT, opts.namespace, name),
            }),
        ),
    };

    let pv = PersistentVolume {
        api_version: "v1".to_string(),
        kind: "PersistentVolume".to_string(),
        metadata: ObjectMeta::cluster_scoped(&volume_name).with_labels(labels),
        spec: PvSpec {
            capacity: PvcStorage {
                storage: size.clone(),
            },
            access_modes: vec!["ReadWriteOnce".to_string()],
            storage_class_name: String::new(),
            persistent_volume_reclaim_policy: "Retain".to_string(),
            claim_ref: Some(ClaimRef {
                namespace: opts.namespace.clone(),
                name: claim_name(name),
            }),
            gce_persistent_disk,
            host_path,
        },
    };
    let pv_ref = graph.register(
        ResourceId::new(KIND_PERSISTENT_VOLUME, &volume_name).with_target(ctx.target.as_deref()),
        Backend::Managed,
        &pv,
        &volume_deps,
    )?;

    let claim_name = claim_name(name);
    let pvc = PersistentVolumeClaim {
        api_version: "v1".to_string(),
        kind: "PersistentVolumeClaim".to_string(),
        metadata: ObjectMeta::new(&claim_name, &opts.namespace).with_labels(labels),
        spec: PvcSpec {
            access_modes: vec!["ReadWriteOnce".to_string()],
            resources: PvcResources {
                requests: PvcStorage { storage: size },
            },
            storage_class_name: String::new(),
            volume_name: Some(volume_name),
        },
    };
    graph.register(
        ctx.cluster_id(KIND_PERSISTENT_VOLUME_CLAIM, &opts.namespace, &claim_name),
        Backend::Managed,
        &pvc,
        &[pv_ref],
    )
}

/// Declare the Debezium server: properties and credentials secrets, offset
/// storage and a single-replica Deployment.
///
/// The rendered properties are hashed onto the pod template, so editing the
/// template or its variables redeploys the server.
pub fn deploy_debezium(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &DebeziumOptions,
) -> Result<DebeziumHandle> {
    let name = server_name(&opts.name);
    let deps = &opts.dependencies;

    let template = load_template(&opts.descriptor.properties_template)?;
    let mut vars = builtin_vars(ctx, &deps.topic);
    vars.extend(opts.descriptor.vars.clone());
    let properties = render_properties_strict(&template, &vars)?;
    let checksum = content_hash(properties.as_bytes());

    let labels = merge_labels([&opts.labels, &suite_labels(&opts.name, COMPONENT)]);

    let config_name = format!("{}-config", name);
    let mut config_secret = Secret::new(&config_name, &opts.namespace)
        .with_data(PROPERTIES_KEY, properties);
    config_secret.metadata = config_secret.metadata.with_labels(&labels);
    let config = graph.register(
        ctx.cluster_id(KIND_SECRET, &opts.namespace, &config_name),
        Backend::Managed,
        &config_secret,
        &opts.depends_on,
    )?;

    let credentials_name = format!("{}-credentials", name);
    let mut credentials_secret = Secret::new(&credentials_name, &opts.namespace);
    credentials_secret.metadata = credentials_secret.metadata.with_labels(&labels);
    if let Some(key) = deps.account.private_key_output() {
        credentials_secret = credentials_secret.with_encoded(CREDENTIALS_KEY, key);
    }
    let credentials = graph.register(
        ctx.cluster_id(KIND_SECRET, &opts.namespace, &credentials_name),
        Backend::Managed,
        &credentials_secret,
        &deps.account.dependencies(),
    )?;

    let claim = declare_storage(graph, ctx, &name, opts, &labels)?;

    let container_opts = ContainerOptions {
        image: format!("{}:{}", DEBEZIUM_IMAGE, opts.descriptor.version),
        resources: opts.descriptor.resources.clone(),
        ..Default::default()
    };
    let mut container = container_opts.to_container("debezium");
    container.env.push(EnvVar::literal(
        "GOOGLE_APPLICATION_CREDENTIALS",
        format!("{}/{}", CREDENTIALS_MOUNT, CREDENTIALS_KEY),
    ));
    container.volume_mounts = vec![
        VolumeMount {
            name: "config".to_string(),
            mount_path: CONFIG_MOUNT.to_string(),
            sub_path: None,
            read_only: Some(true),
        },
        VolumeMount {
            name: "credentials".to_string(),
            mount_path: CREDENTIALS_MOUNT.to_string(),
            sub_path: None,
            read_only: Some(true),
        },
        VolumeMount {
            name: "data".to_string(),
            mount_path: DATA_MOUNT.to_string(),
            sub_path: None,
            read_only: None,
        },
    ];

    let pod = PodOptions {
        labels: labels.clone(),
        annotations: BTreeMap::from([(ANNOTATION_PROPS_CHECKSUM.to_string(), checksum.clone())]),
        node_pool: opts.node_pool.clone(),
        ..Default::default()
    };
    let mut template = pod_template(&name, &pod, vec![container]);
    template.spec.volumes = vec![
        Volume::from_secret("config", &config_name),
        Volume::from_secret("credentials", &credentials_name),
        Volume::from_pvc("data", claim_name(&name)),
    ];

    let deployment = Deployment {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        metadata: ObjectMeta::new(&name, &opts.namespace).with_labels(&labels),
        spec: DeploymentSpec {
            // offsets are single-writer
            replicas: Some(1),
            selector: LabelSelector::for_name(&name),
            template,
            strategy: Some(DeploymentStrategy {
                type_: "Recreate".to_string(),
            }),
        },
    };

    let mut deployment_deps = vec![config.clone(), credentials.clone(), claim.clone()];
    deployment_deps.extend(deps.resources());
    deployment_deps.extend(opts.depends_on.iter().cloned());
    let deployment = graph.register(
        ctx.cluster_id(KIND_DEPLOYMENT, &opts.namespace, &name),
        Backend::Managed,
        &deployment,
        &deployment_deps,
    )?;

    info!(
        name = %name,
        namespace = %opts.namespace,
        topic = %deps.topic.name,
        checksum = %checksum,
        target = ?ctx.target,
        "declared debezium server"
    );
    Ok(DebeziumHandle {
        name,
        deployment,
        config,
        credentials,
        claim,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{adhoc, managed};
    use keel_gcp::iam::KIND_SERVICE_ACCOUNT_KEY;
    use std::io::Write;

    const TEMPLATE: &str = "debezium.source.database.hostname=%DB_HOST%\n\
                            debezium.sink.pubsub.project.id=%PROJECT_ID%\n\
                            debezium.source.offset.storage.file.filename=%OFFSET_FILE%\n";

    fn template_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn descriptor(path: &std::path::Path, host: &str) -> DebeziumDescriptor {
        DebeziumDescriptor {
            properties_template: path.to_path_buf(),
            vars: BTreeMap::from([("DB_HOST".to_string(), host.to_string())]),
            topic: "orders-cdc".to_string(),
            version: "2.7".to_string(),
            ..Default::default()
        }
    }

    fn deploy(
        graph: &mut ResourceGraph,
        ctx: &DeployContext,
        descriptor: DebeziumDescriptor,
    ) -> Result<DebeziumHandle> {
        let dependencies = create_debezium_dependencies(
            graph,
            ctx,
            &DebeziumDependencyOptions {
                name: "orders".to_string(),
                topic: descriptor.topic.clone(),
            },
        )?;
        deploy_debezium(
            graph,
            ctx,
            &DebeziumOptions {
                name: "orders".to_string(),
                namespace: "orders".to_string(),
                descriptor,
                dependencies,
                node_pool: None,
                labels: BTreeMap::new(),
                depends_on: vec![],
            },
        )
    }

    // =========================================================================
    // Story: Dependencies provision a keyed publisher and its topic
    // =========================================================================

    #[test]
    fn dependencies_declare_account_key_and_topic() {
        let mut graph = ResourceGraph::new();
        let deps = create_debezium_dependencies(
            &mut graph,
            &managed(),
            &DebeziumDependencyOptions {
                name: "orders".to_string(),
                topic: "orders-cdc".to_string(),
            },
        )
        .unwrap();
        assert_eq!(deps.account.account.email, "orders-cdc@acme-prod.iam.gserviceaccount.com");
        assert_eq!(deps.account.role_bindings.len(), 2);
        assert!(deps.account.key.is_some());
        assert_eq!(graph.of_kind(KIND_SERVICE_ACCOUNT_KEY).count(), 1);
        assert_eq!(deps.topic.name, "orders-cdc");
        // account + 2 roles + key + topic
        assert_eq!(deps.resources().len(), 5);
    }

    // =========================================================================
    // Story: The server is a single Recreate replica with a props checksum
    // =========================================================================

    #[test]
    fn server_renders_properties_into_secret() {
        let file = template_file(TEMPLATE);
        let mut graph = ResourceGraph::new();
        let handle = deploy(&mut graph, &managed(), descriptor(file.path(), "10.0.0.5")).unwrap();

        let config = &graph.get(handle.config.id()).unwrap().body;
        let props = config["stringData"][PROPERTIES_KEY].as_str().unwrap();
        assert!(props.contains("hostname=10.0.0.5"));
        assert!(props.contains("project.id=acme-prod"));
        assert!(props.contains("filename=/debezium/data/offsets.dat"));
        assert_eq!(handle.checksum, content_hash(props.as_bytes()));
    }

    #[test]
    fn deployment_is_single_replica_recreate() {
        let file = template_file(TEMPLATE);
        let mut graph = ResourceGraph::new();
        let handle = deploy(&mut graph, &managed(), descriptor(file.path(), "10.0.0.5")).unwrap();

        let body = &graph.get(handle.deployment.id()).unwrap().body;
        assert_eq!(body["spec"]["replicas"], 1);
        assert_eq!(body["spec"]["strategy"]["type"], "Recreate");
        assert_eq!(
            body["spec"]["template"]["metadata"]["annotations"][ANNOTATION_PROPS_CHECKSUM],
            handle.checksum.as_str()
        );
        assert_eq!(
            body["spec"]["template"]["spec"]["containers"][0]["image"],
            "quay.io/debezium/server:2.7"
        );
    }

    #[test]
    fn deployment_waits_for_topic_secrets_and_claim() {
        let file = template_file(TEMPLATE);
        let mut graph = ResourceGraph::new();
        let handle = deploy(&mut graph, &managed(), descriptor(file.path(), "10.0.0.5")).unwrap();

        let topic = graph
            .of_kind(keel_gcp::pubsub::KIND_TOPIC)
            .next()
            .unwrap()
            .id
            .clone();
        let id = handle.deployment.id();
        assert!(graph.depends_on(id, &topic));
        assert!(graph.depends_on(id, handle.config.id()));
        assert!(graph.depends_on(id, handle.credentials.id()));
        assert!(graph.depends_on(id, handle.claim.id()));
    }

    #[test]
    fn credentials_carry_the_key_output() {
        let file = template_file(TEMPLATE);
        let mut graph = ResourceGraph::new();
        let handle = deploy(&mut graph, &managed(), descriptor(file.path(), "h")).unwrap();
        let body = &graph.get(handle.credentials.id()).unwrap().body;
        let key = body["data"][CREDENTIALS_KEY].as_str().unwrap();
        assert!(key.starts_with("${") && key.ends_with(".privateKey}"));
    }

    #[test]
    fn changed_variables_change_the_checksum() {
        let file = template_file(TEMPLATE);
        let mut first = ResourceGraph::new();
        let mut second = ResourceGraph::new();
        let a = deploy(&mut first, &managed(), descriptor(file.path(), "10.0.0.5")).unwrap();
        let b = deploy(&mut second, &managed(), descriptor(file.path(), "10.0.0.6")).unwrap();
        assert_ne!(a.checksum, b.checksum);
    }

    // =========================================================================
    // Story: Offset storage follows the backend
    // =========================================================================

    #[test]
    fn managed_storage_uses_a_persistent_disk() {
        let file = template_file(TEMPLATE);
        let mut graph = ResourceGraph::new();
        deploy(&mut graph, &managed(), descriptor(file.path(), "h")).unwrap();

        assert_eq!(graph.of_kind(KIND_DISK).count(), 1);
        let pv = graph.of_kind(KIND_PERSISTENT_VOLUME).next().unwrap();
        assert_eq!(pv.body["spec"]["gcePersistentDisk"]["pdName"], "orders-orders-debezium-offsets");
        assert!(pv.body["spec"].get("hostPath").is_none());
        assert_eq!(pv.body["spec"]["capacity"]["storage"], "10Gi");
        assert_eq!(pv.body["spec"]["claimRef"]["name"], "orders-debezium-offsets");
    }

    #[test]
    fn adhoc_storage_uses_a_host_path() {
        let file = template_file(TEMPLATE);
        let mut graph = ResourceGraph::new();
        deploy(&mut graph, &adhoc(), descriptor(file.path(), "postgres")).unwrap();

        assert_eq!(graph.of_kind(KIND_DISK).count(), 0);
        let pv = graph.of_kind(KIND_PERSISTENT_VOLUME).next().unwrap();
        assert_eq!(
            pv.body["spec"]["hostPath"]["path"],
            "/var/lib/keel/debezium/orders/orders-debezium"
        );
    }

    // =========================================================================
    // Story: Template problems fail before the server is declared
    // =========================================================================

    #[test]
    fn unresolved_placeholder_is_config_error() {
        let file = template_file("a=%NOT_SET%\n");
        let mut graph = ResourceGraph::new();
        let err = deploy(&mut graph, &managed(), descriptor(file.path(), "h")).unwrap_err();
        assert!(err.is_config());
        assert_eq!(graph.of_kind(KIND_DEPLOYMENT).count(), 0);
    }

    #[test]
    fn caller_vars_override_builtins() {
        let file = template_file("p=%PROJECT_ID%\n");
        let mut d = descriptor(file.path(), "h");
        d.vars.insert("PROJECT_ID".to_string(), "other".to_string());
        let mut graph = ResourceGraph::new();
        let handle = deploy(&mut graph, &managed(), d).unwrap();
        let body = &graph.get(handle.config.id()).unwrap().body;
        assert_eq!(body["stringData"][PROPERTIES_KEY], "p=other\n");
    }
}

//! End-to-end suite scenarios: a descriptor goes in, a resource graph comes
//! out, and the adhoc graph's local part is applied against in-memory
//! emulator fakes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel::common::{ANNOTATION_DOTENV_CHECKSUM, ANNOTATION_PROPS_CHECKSUM, ANNOTATION_SECRETS_CHECKSUM};
use keel::emulator::{
    local_providers, AppliedState, DynamicApplier, EmulatorResult, LocalContext, PubSubAdmin,
    SqlAdmin, SubscriptionSpec,
};
use keel::gcp::iam::KIND_SERVICE_ACCOUNT_IAM_MEMBER;
use keel::gcp::pubsub::KIND_LOCAL_TOPIC;
use keel::gcp::LocalSqlConnection;
use keel::workload::k8s::{
    KIND_DEPLOYMENT, KIND_HPA, KIND_JOB, KIND_PDB, KIND_SECRET, KIND_SERVICE,
};
use keel::{
    deploy_app_suite, Backend, DeployContext, DeployTarget, Environment, ResourceGraph,
    SuiteDescriptor,
};

const SUITE: &str = r#"
name: orders
namespace: orders
image: europe-docker.pkg.dev/acme/apps/orders
tag: 2024-06-01-abcdef12
serviceAccount: orders@acme-prod.iam.gserviceaccount.com
secrets:
  databaseUrl: postgres://orders
apps:
  - name: api
    resources: { cpu: 250m, memory: 512Mi }
    ports:
      - name: http
        port: 80
        targetPort: 8080
    spot: { enabled: true, weight: 100 }
migrations:
  command: ["./migrate"]
"#;

fn suite(dotenv: Option<&Path>) -> SuiteDescriptor {
    let mut suite = SuiteDescriptor::from_yaml_str(SUITE).unwrap();
    suite.dotenv_path = dotenv.map(Path::to_path_buf);
    suite
}

fn managed() -> DeployContext {
    DeployContext::new("acme-prod", "europe-west1", Environment::Managed)
}

fn adhoc() -> DeployContext {
    DeployContext::new("acme-dev", "europe-west1", Environment::Adhoc)
}

fn pod_annotation(graph: &ResourceGraph, key: &str) -> Option<String> {
    let deployment = graph.of_kind(KIND_DEPLOYMENT).next()?;
    deployment.body["spec"]["template"]["metadata"]["annotations"][key]
        .as_str()
        .map(str::to_string)
}

// =========================================================================
// Story: Managed suite with one exposed app and one migration
// =========================================================================

#[test]
fn managed_suite_declares_the_full_rollout() {
    let mut graph = ResourceGraph::new();
    let out = deploy_app_suite(&mut graph, &managed(), &suite(None), &[DeployTarget::primary("prod")])
        .unwrap();

    assert_eq!(graph.of_kind(KIND_SERVICE_ACCOUNT_IAM_MEMBER).count(), 1);
    assert_eq!(graph.of_kind(KIND_SECRET).count(), 1);
    assert_eq!(graph.of_kind(KIND_JOB).count(), 1);
    assert_eq!(graph.of_kind(KIND_DEPLOYMENT).count(), 1);
    assert_eq!(graph.of_kind(KIND_HPA).count(), 1);
    assert_eq!(graph.of_kind(KIND_PDB).count(), 1);
    assert_eq!(graph.of_kind(KIND_SERVICE).count(), 1);

    let prod = out.primary().unwrap();
    let secret = prod.secrets[0].resource.id();
    let job = prod.migrations[0].id();
    assert!(graph.depends_on(job, secret));

    let app = &prod.apps[0];
    for resource in app.resources() {
        assert!(
            graph.depends_on(resource.id(), job),
            "{} does not wait for the migration",
            resource.id()
        );
    }
    assert!(app.service.is_some());
    assert!(pod_annotation(&graph, ANNOTATION_SECRETS_CHECKSUM).is_some());
}

#[test]
fn managed_spot_preference_keeps_a_fallback() {
    let mut graph = ResourceGraph::new();
    deploy_app_suite(&mut graph, &managed(), &suite(None), &[DeployTarget::primary("prod")])
        .unwrap();

    let deployment = graph.of_kind(KIND_DEPLOYMENT).next().unwrap();
    let spec = &deployment.body["spec"]["template"]["spec"];
    let preferred = spec["affinity"]["nodeAffinity"]
        ["preferredDuringSchedulingIgnoredDuringExecution"]
        .as_array()
        .unwrap();
    let weights: BTreeSet<u64> = preferred
        .iter()
        .map(|term| term["weight"].as_u64().unwrap())
        .collect();
    assert_eq!(weights, BTreeSet::from([1, 100]));
    assert_eq!(spec["tolerations"].as_array().unwrap().len(), 1);
}

#[test]
fn rendered_graph_lists_every_declaration() {
    let mut graph = ResourceGraph::new();
    deploy_app_suite(&mut graph, &managed(), &suite(None), &[DeployTarget::primary("prod")])
        .unwrap();
    let yaml = graph.to_yaml().unwrap();
    assert_eq!(yaml.matches("---\n").count(), graph.len());
    assert!(yaml.contains("kind: Deployment"));
}

// =========================================================================
// Story: Adhoc suite reads .env and rolls pods when it changes
// =========================================================================

fn write(path: &Path, content: &str) {
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

#[test]
fn adhoc_suite_has_no_scaling_or_spot() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = ResourceGraph::new();
    deploy_app_suite(
        &mut graph,
        &adhoc(),
        &suite(Some(&dir.path().join(".env"))),
        &[DeployTarget::primary("local")],
    )
    .unwrap();

    assert_eq!(graph.of_kind(KIND_HPA).count(), 0);
    assert_eq!(graph.of_kind(KIND_PDB).count(), 0);
    let deployment = graph.of_kind(KIND_DEPLOYMENT).next().unwrap();
    let spec = &deployment.body["spec"]["template"]["spec"];
    assert!(spec.get("tolerations").is_none());
    assert!(spec.get("affinity").is_none());
    // no .env on disk
    assert!(pod_annotation(&graph, ANNOTATION_DOTENV_CHECKSUM).is_none());
}

#[test]
fn dotenv_change_changes_the_pod_annotation() {
    let dir = tempfile::tempdir().unwrap();
    let dotenv = dir.path().join(".env");

    write(&dotenv, "FEATURE_FLAGS=a\nDEBUG=1\n");
    let mut first = ResourceGraph::new();
    let out = deploy_app_suite(&mut first, &adhoc(), &suite(Some(&dotenv)), &[DeployTarget::primary("local")])
        .unwrap();
    let before = pod_annotation(&first, ANNOTATION_DOTENV_CHECKSUM).unwrap();

    let local = out.primary().unwrap();
    let dotenv_secret = local
        .secrets
        .iter()
        .find(|s| s.name == "orders-dotenv")
        .unwrap();
    let body = &first.get(dotenv_secret.resource.id()).unwrap().body;
    assert_eq!(body["stringData"]["DEBUG"], "1");
    assert!(first.depends_on(local.apps[0].deployment.id(), dotenv_secret.resource.id()));

    write(&dotenv, "FEATURE_FLAGS=a,b\nDEBUG=1\n");
    let mut second = ResourceGraph::new();
    deploy_app_suite(&mut second, &adhoc(), &suite(Some(&dotenv)), &[DeployTarget::primary("local")])
        .unwrap();
    let after = pod_annotation(&second, ANNOTATION_DOTENV_CHECKSUM).unwrap();

    assert_ne!(before, after);
    // the secret keeps its identity; only the annotation moves
    assert!(second.contains(dotenv_secret.resource.id()));
}

#[test]
fn adhoc_with_two_targets_is_rejected() {
    let mut graph = ResourceGraph::new();
    let err = deploy_app_suite(
        &mut graph,
        &adhoc(),
        &suite(None),
        &[DeployTarget::primary("local"), DeployTarget::replica("other")],
    )
    .unwrap_err();
    assert!(err.is_config());
}

// =========================================================================
// Story: Adhoc CDC topic is realised on the emulator
// =========================================================================

#[derive(Default)]
struct FakePubSub {
    topics: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl PubSubAdmin for FakePubSub {
    async fn topic_exists(&self, project: &str, topic: &str) -> EmulatorResult<bool> {
        Ok(self.topics.lock().unwrap().contains(&format!("{}/{}", project, topic)))
    }

    async fn create_topic(&self, project: &str, topic: &str) -> EmulatorResult<()> {
        self.topics
            .lock()
            .unwrap()
            .insert(format!("{}/{}", project, topic));
        Ok(())
    }

    async fn subscription_exists(&self, _project: &str, _subscription: &str) -> EmulatorResult<bool> {
        Ok(true)
    }

    async fn create_subscription(&self, _project: &str, _spec: &SubscriptionSpec) -> EmulatorResult<()> {
        Ok(())
    }

    async fn delete_subscription(&self, _project: &str, _subscription: &str) -> EmulatorResult<()> {
        Ok(())
    }
}

struct NoSql;

#[async_trait]
impl SqlAdmin for NoSql {
    async fn database_exists(&self, _conn: &LocalSqlConnection, _name: &str) -> EmulatorResult<bool> {
        Ok(true)
    }

    async fn create_database(&self, _conn: &LocalSqlConnection, _name: &str) -> EmulatorResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn adhoc_cdc_topic_is_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("application.properties");
    write(
        &template,
        "debezium.sink.pubsub.project.id=%PROJECT_ID%\n\
         debezium.source.database.hostname=%DB_HOST%\n",
    );

    let mut s = suite(Some(&dir.path().join(".env")));
    s.cdc = Some(keel::cdc::DebeziumDescriptor {
        properties_template: template,
        vars: BTreeMap::from([("DB_HOST".to_string(), "postgres".to_string())]),
        topic: "orders-changes".to_string(),
        version: "2.7".to_string(),
        ..Default::default()
    });

    let mut graph = ResourceGraph::new();
    let out = deploy_app_suite(&mut graph, &adhoc(), &s, &[DeployTarget::primary("local")]).unwrap();
    let cdc = out.primary().unwrap().cdc.as_ref().unwrap();
    assert_eq!(graph.for_backend(Backend::Local).count(), 1);
    assert_eq!(graph.of_kind(KIND_LOCAL_TOPIC).count(), 1);
    let server = &graph.get(cdc.deployment.id()).unwrap().body;
    assert_eq!(
        server["spec"]["template"]["metadata"]["annotations"][ANNOTATION_PROPS_CHECKSUM],
        cdc.checksum.as_str()
    );

    let pubsub = Arc::new(FakePubSub::default());
    let ctx = Arc::new(LocalContext::with_clients(pubsub.clone(), Arc::new(NoSql)));
    let applier = DynamicApplier::with_providers(local_providers(ctx));

    let mut state = AppliedState::default();
    let first = applier.apply(&graph, &mut state).await.unwrap();
    assert_eq!(first.created.len(), 1);
    assert!(pubsub.topics.lock().unwrap().contains("acme-dev/orders-changes"));

    let second = applier.apply(&graph, &mut state).await.unwrap();
    assert!(second.created.is_empty());
    assert_eq!(second.unchanged.len(), 1);
}

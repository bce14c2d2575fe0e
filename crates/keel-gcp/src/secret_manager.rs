//! Secret Manager materialization
//!
//! One secret and one version per configured key. The returned handle
//! carries the `<secret_id>:<version>` reference used by Cloud Run and
//! Cloud Build secret bindings; the version number is the trailing segment
//! of the version's fully-qualified path
//! (`projects/<p>/secrets/<id>/versions/<n>`).

use std::collections::BTreeMap;

use keel_common::naming::camel_to_underscore;
use keel_common::{Backend, DeployContext, Error, ResourceGraph, ResourceRef, Result};
use serde::Serialize;
use tracing::info;

/// Secret Manager secret
pub const KIND_SECRET: &str = "gcp:secretmanager:Secret";
/// Secret Manager secret version
pub const KIND_SECRET_VERSION: &str = "gcp:secretmanager:SecretVersion";
/// Secret-level IAM member
pub const KIND_SECRET_IAM_MEMBER: &str = "gcp:secretmanager:SecretIamMember";

/// Options for [`create_secrets`]
#[derive(Clone, Debug, Default)]
pub struct SecretsOptions {
    /// Prefix for secret ids (usually the suite name)
    pub prefix: String,
    /// camelCase key -> secret value
    pub values: BTreeMap<String, String>,
    /// Version number being declared
    pub version: Option<u64>,
    /// Labels applied to every secret
    pub labels: BTreeMap<String, String>,
    /// Members granted `roles/secretmanager.secretAccessor` on every secret
    pub accessors: Vec<String>,
}

/// A materialized secret
#[derive(Clone, Debug)]
pub struct SecretHandle {
    /// Original camelCase key
    pub key: String,
    /// ENV_VAR form of the key
    pub env_name: String,
    /// Generated secret id
    pub secret_id: String,
    /// Secret declaration
    pub secret: ResourceRef,
    /// Version declaration
    pub version: ResourceRef,
    /// Fully-qualified version path
    pub version_path: String,
    /// `<secret_id>:<version>` reference
    pub reference: String,
}

/// Parse the numeric version from a fully-qualified version path
pub fn parse_version_suffix(path: &str) -> Result<u64> {
    path.rsplit('/')
        .next()
        .and_then(|segment| segment.parse::<u64>().ok())
        .ok_or_else(|| Error::format("secret version path", path))
}

/// Build the reference string for a secret version
pub fn secret_reference(secret_id: &str, version_path: &str) -> Result<String> {
    Ok(format!("{}:{}", secret_id, parse_version_suffix(version_path)?))
}

fn secret_id(prefix: &str, key: &str) -> String {
    let slug = camel_to_underscore(key).to_ascii_lowercase().replace('_', "-");
    if prefix.is_empty() {
        slug
    } else {
        format!("{}-{}", prefix, slug)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretBody<'a> {
    secret_id: &'a str,
    project: &'a str,
    replication: Replication,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Replication {
    auto: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionBody<'a> {
    secret: String,
    secret_data: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessorBody<'a> {
    secret_id: String,
    role: &'static str,
    member: &'a str,
}

/// Create one secret + version per configured key
pub fn create_secrets(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &SecretsOptions,
) -> Result<Vec<SecretHandle>> {
    let version = opts.version.unwrap_or(1);
    let mut handles = Vec::with_capacity(opts.values.len());

    for (key, value) in &opts.values {
        let id = secret_id(&opts.prefix, key);
        let secret = graph.register(
            ctx.cloud_id(KIND_SECRET, &id),
            Backend::Managed,
            &SecretBody {
                secret_id: &id,
                project: &ctx.project,
                replication: Replication {
                    auto: BTreeMap::new(),
                },
                labels: &opts.labels,
            },
            &[],
        )?;

        let version_path = format!(
            "projects/{}/secrets/{}/versions/{}",
            ctx.project_path(),
            id,
            version
        );
        let version_ref = graph.register(
            ctx.cloud_id(KIND_SECRET_VERSION, &format!("{}-v{}", id, version)),
            Backend::Managed,
            &VersionBody {
                secret: secret.output("id"),
                secret_data: value,
                name: &version_path,
            },
            &[secret.clone()],
        )?;

        for (i, member) in opts.accessors.iter().enumerate() {
            graph.register(
                ctx.cloud_id(KIND_SECRET_IAM_MEMBER, &format!("{}-accessor-{}", id, i)),
                Backend::Managed,
                &AccessorBody {
                    secret_id: secret.output("id"),
                    role: "roles/secretmanager.secretAccessor",
                    member,
                },
                &[secret.clone()],
            )?;
        }

        handles.push(SecretHandle {
            key: key.clone(),
            env_name: camel_to_underscore(key),
            reference: secret_reference(&id, &version_path)?,
            secret_id: id,
            secret,
            version: version_ref,
            version_path,
        });
    }

    info!(prefix = %opts.prefix, count = handles.len(), "declared secret manager secrets");
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::managed;

    fn options(version: Option<u64>) -> SecretsOptions {
        SecretsOptions {
            prefix: "orders".to_string(),
            values: BTreeMap::from([
                ("databaseUrl".to_string(), "postgres://db".to_string()),
                ("apiKey".to_string(), "k".to_string()),
            ]),
            version,
            ..Default::default()
        }
    }

    #[test]
    fn one_secret_and_version_per_key() {
        let mut graph = ResourceGraph::new();
        let handles = create_secrets(&mut graph, &managed(), &options(None)).unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(graph.of_kind(KIND_SECRET).count(), 2);
        assert_eq!(graph.of_kind(KIND_SECRET_VERSION).count(), 2);

        let db = handles.iter().find(|h| h.key == "databaseUrl").unwrap();
        assert_eq!(db.secret_id, "orders-database-url");
        assert_eq!(db.env_name, "DATABASE_URL");
        assert_eq!(
            db.version_path,
            "projects/123456/secrets/orders-database-url/versions/1"
        );
        assert_eq!(db.reference, "orders-database-url:1");
        assert_eq!(graph.dependencies_of(db.version.id()), &[db.secret.id().clone()]);
    }

    #[test]
    fn reference_round_trips_version_number() {
        for version in [1_u64, 7, 42, 1000] {
            let mut graph = ResourceGraph::new();
            let handles = create_secrets(&mut graph, &managed(), &options(Some(version))).unwrap();
            for handle in handles {
                let (_, suffix) = handle.reference.rsplit_once(':').unwrap();
                assert_eq!(suffix.parse::<u64>().unwrap(), version);
                assert_eq!(parse_version_suffix(&handle.version_path).unwrap(), version);
            }
        }
    }

    #[test]
    fn malformed_version_path_is_format_error() {
        let err = parse_version_suffix("projects/p/secrets/s/versions/latest").unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(parse_version_suffix("").is_err());
    }

    #[test]
    fn accessors_get_one_binding_per_secret() {
        let mut graph = ResourceGraph::new();
        let mut opts = options(None);
        opts.accessors = vec!["serviceAccount:run@acme-prod.iam.gserviceaccount.com".to_string()];
        create_secrets(&mut graph, &managed(), &opts).unwrap();
        assert_eq!(graph.of_kind(KIND_SECRET_IAM_MEMBER).count(), 2);
    }
}

//! Kubernetes Secrets with content checksums
//!
//! The checksum goes on dependent pod templates so a content change rolls
//! the pods even though the Secret name stays the same.

use std::collections::BTreeMap;

use keel_common::hash::map_hash;
use keel_common::naming::camel_to_underscore;
use keel_common::{Backend, DeployContext, ResourceGraph, ResourceRef, Result};
use tracing::info;

use crate::k8s::{Secret, KIND_SECRET};

/// Options for [`create_secret`]
#[derive(Clone, Debug, Default)]
pub struct SecretOptions {
    /// Secret name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Key/value data
    pub data: BTreeMap<String, String>,
    /// Convert camelCase keys to ENV_VAR names
    pub env_keys: bool,
    /// Extra labels
    pub labels: BTreeMap<String, String>,
    /// Dependencies
    pub depends_on: Vec<ResourceRef>,
}

/// A declared Secret
#[derive(Clone, Debug)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Declaration
    pub resource: ResourceRef,
    /// Checksum of the data
    pub checksum: String,
}

/// Declare a Secret and compute its checksum
pub fn create_secret(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &SecretOptions,
) -> Result<SecretRef> {
    let data: BTreeMap<String, String> = if opts.env_keys {
        opts.data
            .iter()
            .map(|(k, v)| (camel_to_underscore(k), v.clone()))
            .collect()
    } else {
        opts.data.clone()
    };
    let checksum = map_hash(&data);

    let mut secret = Secret::new(&opts.name, &opts.namespace);
    secret.metadata = secret.metadata.with_labels(&opts.labels);
    secret.string_data = data;

    let resource = graph.register(
        ctx.cluster_id(KIND_SECRET, &opts.namespace, &opts.name),
        Backend::Managed,
        &secret,
        &opts.depends_on,
    )?;

    info!(
        name = %opts.name,
        namespace = %opts.namespace,
        keys = secret.string_data.len(),
        "declared secret"
    );
    Ok(SecretRef {
        name: opts.name.clone(),
        resource,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::managed;

    #[test]
    fn env_keys_are_converted_and_checksummed() {
        let mut graph = ResourceGraph::new();
        let opts = SecretOptions {
            name: "orders-secrets".to_string(),
            namespace: "orders".to_string(),
            data: BTreeMap::from([("databaseUrl".to_string(), "postgres://db".to_string())]),
            env_keys: true,
            ..Default::default()
        };
        let secret = create_secret(&mut graph, &managed(), &opts).unwrap();
        let body = &graph.get(secret.resource.id()).unwrap().body;
        assert_eq!(body["stringData"]["DATABASE_URL"], "postgres://db");
        assert_eq!(body["type"], "Opaque");
        assert_eq!(secret.checksum.len(), 16);
    }

    #[test]
    fn checksum_tracks_content() {
        let mut graph = ResourceGraph::new();
        let ctx = managed();
        let mut opts = SecretOptions {
            name: "a".to_string(),
            namespace: "orders".to_string(),
            data: BTreeMap::from([("K".to_string(), "1".to_string())]),
            ..Default::default()
        };
        let a = create_secret(&mut graph, &ctx, &opts).unwrap();
        opts.name = "b".to_string();
        opts.data.insert("K".to_string(), "2".to_string());
        let b = create_secret(&mut graph, &ctx, &opts).unwrap();
        assert_ne!(a.checksum, b.checksum);
    }
}

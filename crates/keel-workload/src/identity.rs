//! Workload identity
//!
//! Bridges a cloud service account to a Kubernetes ServiceAccount. The only
//! grant ever made is `roles/iam.workloadIdentityUser` on the cloud account
//! for the single KSA principal. Without a cloud account there is no KSA and
//! the workload runs with the namespace default identity.

use keel_common::{DeployContext, ObjectMeta, ResourceGraph, ResourceRef, Result};
use keel_gcp::iam::bind_service_account_member;
use keel_gcp::CloudServiceAccount;
use tracing::{debug, info};

use crate::k8s::{ServiceAccount, KIND_SERVICE_ACCOUNT};

/// Annotation linking a KSA to its cloud service account
pub const ANNOTATION_GCP_SERVICE_ACCOUNT: &str = "iam.gke.io/gcp-service-account";
/// Role granted to the KSA principal
pub const WORKLOAD_IDENTITY_ROLE: &str = "roles/iam.workloadIdentityUser";

/// Options for [`bind_workload_identity`]
#[derive(Clone, Debug)]
pub struct WorkloadIdentityOptions {
    /// KSA name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Cloud account to impersonate
    pub account: Option<CloudServiceAccount>,
    /// Declare the IAM binding (only one target cluster should)
    pub bind: bool,
}

/// Identity a workload runs as
#[derive(Clone, Debug, PartialEq)]
pub enum WorkloadIdentity {
    /// No cloud identity: namespace default KSA, no cloud privileges
    None,
    /// KSA bound to a cloud account
    Bound {
        /// KSA name
        name: String,
        /// Cloud account email
        email: String,
        /// KSA declaration
        service_account: ResourceRef,
        /// IAM binding, when declared by this pass
        binding: Option<ResourceRef>,
    },
}

impl WorkloadIdentity {
    /// KSA name to set on pod specs
    pub fn service_account_name(&self) -> Option<&str> {
        match self {
            WorkloadIdentity::None => None,
            WorkloadIdentity::Bound { name, .. } => Some(name),
        }
    }

    /// Declarations pods should wait for
    pub fn dependencies(&self) -> Vec<ResourceRef> {
        match self {
            WorkloadIdentity::None => Vec::new(),
            WorkloadIdentity::Bound {
                service_account,
                binding,
                ..
            } => std::iter::once(service_account.clone())
                .chain(binding.iter().cloned())
                .collect(),
        }
    }
}

/// IAM principal of a KSA in the project's workload pool
pub fn ksa_member(ctx: &DeployContext, namespace: &str, name: &str) -> String {
    format!(
        "serviceAccount:{}[{}/{}]",
        ctx.workload_pool(),
        namespace,
        name
    )
}

/// Create the KSA for a cloud account and optionally bind it
pub fn bind_workload_identity(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &WorkloadIdentityOptions,
) -> Result<WorkloadIdentity> {
    let Some(account) = &opts.account else {
        debug!(name = %opts.name, namespace = %opts.namespace, "no cloud account, skipping workload identity");
        return Ok(WorkloadIdentity::None);
    };

    let ksa = ServiceAccount {
        api_version: "v1".to_string(),
        kind: "ServiceAccount".to_string(),
        metadata: ObjectMeta::new(&opts.name, &opts.namespace)
            .with_annotation(ANNOTATION_GCP_SERVICE_ACCOUNT, &account.email),
    };
    let service_account = graph.register(
        ctx.cluster_id(KIND_SERVICE_ACCOUNT, &opts.namespace, &opts.name),
        keel_common::Backend::Managed,
        &ksa,
        &account.resource.iter().cloned().collect::<Vec<_>>(),
    )?;

    let binding = if opts.bind {
        Some(bind_service_account_member(
            graph,
            ctx,
            &format!("{}-{}-workload-identity", opts.namespace, opts.name),
            account,
            WORKLOAD_IDENTITY_ROLE,
            &ksa_member(ctx, &opts.namespace, &opts.name),
        )?)
    } else {
        None
    };

    info!(
        name = %opts.name,
        namespace = %opts.namespace,
        email = %account.email,
        bound = binding.is_some(),
        "declared workload identity"
    );
    Ok(WorkloadIdentity::Bound {
        name: opts.name.clone(),
        email: account.email.clone(),
        service_account,
        binding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::managed;
    use keel_gcp::iam::KIND_SERVICE_ACCOUNT_IAM_MEMBER;

    fn opts(account: Option<CloudServiceAccount>, bind: bool) -> WorkloadIdentityOptions {
        WorkloadIdentityOptions {
            name: "orders".to_string(),
            namespace: "orders".to_string(),
            account,
            bind,
        }
    }

    #[test]
    fn no_account_yields_sentinel_and_no_declarations() {
        let mut graph = ResourceGraph::new();
        let identity = bind_workload_identity(&mut graph, &managed(), &opts(None, true)).unwrap();
        assert_eq!(identity, WorkloadIdentity::None);
        assert!(identity.service_account_name().is_none());
        assert!(identity.dependencies().is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn bound_identity_grants_only_workload_identity_user() {
        let mut graph = ResourceGraph::new();
        let account = CloudServiceAccount::existing("orders@acme-prod.iam.gserviceaccount.com");
        let identity =
            bind_workload_identity(&mut graph, &managed(), &opts(Some(account), true)).unwrap();

        let WorkloadIdentity::Bound {
            service_account,
            binding,
            ..
        } = &identity
        else {
            panic!("expected bound identity");
        };
        let ksa = graph.get(service_account.id()).unwrap();
        assert_eq!(
            ksa.body["metadata"]["annotations"][ANNOTATION_GCP_SERVICE_ACCOUNT],
            "orders@acme-prod.iam.gserviceaccount.com"
        );

        let bindings: Vec<_> = graph.of_kind(KIND_SERVICE_ACCOUNT_IAM_MEMBER).collect();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].body["role"], WORKLOAD_IDENTITY_ROLE);
        assert_eq!(
            bindings[0].body["member"],
            "serviceAccount:acme-prod.svc.id.goog[orders/orders]"
        );
        assert_eq!(binding.as_ref().unwrap().id(), &bindings[0].id);
        assert_eq!(identity.dependencies().len(), 2);
    }

    #[test]
    fn unbound_identity_still_creates_ksa() {
        let mut graph = ResourceGraph::new();
        let account = CloudServiceAccount::existing("orders@acme-prod.iam.gserviceaccount.com");
        let identity =
            bind_workload_identity(&mut graph, &managed(), &opts(Some(account), false)).unwrap();
        assert_eq!(identity.service_account_name(), Some("orders"));
        assert_eq!(graph.of_kind(KIND_SERVICE_ACCOUNT_IAM_MEMBER).count(), 0);
        assert_eq!(graph.of_kind(KIND_SERVICE_ACCOUNT).count(), 1);
    }
}

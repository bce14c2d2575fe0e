//! Service accounts and IAM bindings
//!
//! A cloud service account is created together with its project role
//! bindings. Nothing is granted implicitly: callers list every role.

use keel_common::config::StackReference;
use keel_common::{Backend, DeployContext, Error, ResourceGraph, ResourceRef, Result};
use serde::Serialize;
use tracing::info;

/// GCP service account
pub const KIND_SERVICE_ACCOUNT: &str = "gcp:serviceaccount:Account";
/// GCP service account key
pub const KIND_SERVICE_ACCOUNT_KEY: &str = "gcp:serviceaccount:Key";
/// Project-level IAM member
pub const KIND_PROJECT_IAM_MEMBER: &str = "gcp:projects:IAMMember";
/// Service-account-level IAM member
pub const KIND_SERVICE_ACCOUNT_IAM_MEMBER: &str = "gcp:serviceaccount:IAMMember";

/// Stack output naming the shared push-invoker service account email
pub const PUSH_INVOKER_OUTPUT: &str = "pushInvokerEmail";

/// Email address of a service account in a project
pub fn service_account_email(account_id: &str, project: &str) -> String {
    format!("{}@{}.iam.gserviceaccount.com", account_id, project)
}

/// Shared push-invoker identity exported by another stack
pub fn push_invoker_email(stack: &StackReference) -> Result<String> {
    stack.require_output(PUSH_INVOKER_OUTPUT)
}

/// Reference to a cloud service account, declared here or elsewhere
#[derive(Clone, Debug, PartialEq)]
pub struct CloudServiceAccount {
    /// Service account email
    pub email: String,
    /// Declaration handle when the account was declared in this graph
    pub resource: Option<ResourceRef>,
}

impl CloudServiceAccount {
    /// Reference an existing account by email
    pub fn existing(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            resource: None,
        }
    }

    /// IAM member string for this account
    pub fn member(&self) -> String {
        format!("serviceAccount:{}", self.email)
    }

    /// Fully-qualified resource path
    pub fn resource_path(&self, project: &str) -> String {
        format!("projects/{}/serviceAccounts/{}", project, self.email)
    }
}

/// Options for [`create_service_account`]
#[derive(Clone, Debug, Default)]
pub struct ServiceAccountOptions {
    /// Account id (6-30 chars, lowercase letters, digits, hyphens)
    pub account_id: String,
    /// Display name
    pub display_name: Option<String>,
    /// Project roles to grant (e.g. `roles/pubsub.publisher`)
    pub roles: Vec<String>,
    /// Whether to declare a key for the account
    pub create_key: bool,
}

/// Result of [`create_service_account`]
#[derive(Clone, Debug)]
pub struct ServiceAccountHandle {
    /// The account
    pub account: CloudServiceAccount,
    /// One binding per requested role
    pub role_bindings: Vec<ResourceRef>,
    /// Declared key, if requested
    pub key: Option<ResourceRef>,
}

impl ServiceAccountHandle {
    /// Output token for the base64-encoded private key JSON
    pub fn private_key_output(&self) -> Option<String> {
        self.key.as_ref().map(|k| k.output("privateKey"))
    }

    /// Every declaration a consumer of this identity should depend on
    pub fn dependencies(&self) -> Vec<ResourceRef> {
        let mut deps: Vec<ResourceRef> = self.account.resource.iter().cloned().collect();
        deps.extend(self.role_bindings.iter().cloned());
        deps.extend(self.key.iter().cloned());
        deps
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountBody<'a> {
    account_id: &'a str,
    display_name: &'a str,
    project: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectMemberBody<'a> {
    project: &'a str,
    role: &'a str,
    member: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountMemberBody<'a> {
    service_account_id: String,
    role: &'a str,
    member: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyBody {
    service_account_id: String,
}

fn validate_account_id(account_id: &str) -> Result<()> {
    let valid_len = (6..=30).contains(&account_id.len());
    let valid_chars = account_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = account_id.starts_with(|c: char| c.is_ascii_lowercase())
        && !account_id.ends_with('-');
    if valid_len && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(Error::config(
            "iam",
            format!(
                "invalid service account id '{}': must be 6-30 chars of [a-z0-9-], start with a letter",
                account_id
            ),
        ))
    }
}

/// Create a service account and bind its project roles
pub fn create_service_account(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    opts: &ServiceAccountOptions,
) -> Result<ServiceAccountHandle> {
    validate_account_id(&opts.account_id)?;

    let display_name = opts.display_name.as_deref().unwrap_or(&opts.account_id);
    let account_ref = graph.register(
        ctx.cloud_id(KIND_SERVICE_ACCOUNT, &opts.account_id),
        Backend::Managed,
        &AccountBody {
            account_id: &opts.account_id,
            display_name,
            project: &ctx.project,
        },
        &[],
    )?;

    let account = CloudServiceAccount {
        email: service_account_email(&opts.account_id, &ctx.project),
        resource: Some(account_ref.clone()),
    };

    let mut role_bindings = Vec::with_capacity(opts.roles.len());
    for role in &opts.roles {
        let role_slug = role.trim_start_matches("roles/").replace('.', "-");
        let binding = graph.register(
            ctx.cloud_id(
                KIND_PROJECT_IAM_MEMBER,
                &format!("{}-{}", opts.account_id, role_slug),
            ),
            Backend::Managed,
            &ProjectMemberBody {
                project: &ctx.project,
                role,
                member: account.member(),
            },
            &[account_ref.clone()],
        )?;
        role_bindings.push(binding);
    }

    let key = if opts.create_key {
        Some(graph.register(
            ctx.cloud_id(KIND_SERVICE_ACCOUNT_KEY, &format!("{}-key", opts.account_id)),
            Backend::Managed,
            &KeyBody {
                service_account_id: account_ref.output("name"),
            },
            &[account_ref.clone()],
        )?)
    } else {
        None
    };

    info!(
        account = %account.email,
        roles = opts.roles.len(),
        key = opts.create_key,
        "declared service account"
    );

    Ok(ServiceAccountHandle {
        account,
        role_bindings,
        key,
    })
}

/// Grant `member` a role on a service account (e.g. workload identity user)
pub fn bind_service_account_member(
    graph: &mut ResourceGraph,
    ctx: &DeployContext,
    name: &str,
    account: &CloudServiceAccount,
    role: &str,
    member: &str,
) -> Result<ResourceRef> {
    let deps: Vec<ResourceRef> = account.resource.iter().cloned().collect();
    graph.register(
        ctx.cloud_id(KIND_SERVICE_ACCOUNT_IAM_MEMBER, name),
        Backend::Managed,
        &AccountMemberBody {
            service_account_id: account.resource_path(&ctx.project),
            role,
            member,
        },
        &deps,
    )
}

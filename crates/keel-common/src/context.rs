//! Deployment context threaded through every constructor

use serde::{Deserialize, Serialize};

use crate::config::StackConfig;
use crate::graph::ResourceId;

/// Where a stack is deployed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Developer-local or ephemeral target backed by emulators
    Adhoc,
    /// Managed cloud target
    #[default]
    Managed,
}

/// Backend that realises a declaration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Provider-native resource handled by the orchestration engine
    Managed,
    /// Dynamic resource applied by a local provider (emulator, local database)
    Local,
}

/// Explicit deployment context.
///
/// Carries the environment strategy tag instead of each constructor probing
/// the environment on its own.
#[derive(Clone, Debug)]
pub struct DeployContext {
    /// GCP project id
    pub project: String,
    /// GCP project number, used in fully-qualified resource paths
    pub project_number: Option<String>,
    /// GCP region
    pub region: String,
    /// Target environment
    pub environment: Environment,
    /// Target cluster for cluster-side declarations
    pub target: Option<String>,
}

impl DeployContext {
    /// Create a context for a project and environment
    pub fn new(project: impl Into<String>, region: impl Into<String>, environment: Environment) -> Self {
        Self {
            project: project.into(),
            project_number: None,
            region: region.into(),
            environment,
            target: None,
        }
    }

    /// Build a context from stack configuration
    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            project_number: config.project_number.clone(),
            ..Self::new(&config.project, &config.region, config.environment)
        }
    }

    /// Same context scoped to a target cluster
    pub fn for_target(&self, target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..self.clone()
        }
    }

    /// Whether this is an adhoc/local environment
    pub fn is_adhoc(&self) -> bool {
        self.environment == Environment::Adhoc
    }

    /// Backend used for resources with a local stand-in
    pub fn backend(&self) -> Backend {
        match self.environment {
            Environment::Adhoc => Backend::Local,
            Environment::Managed => Backend::Managed,
        }
    }

    /// Identity of a cloud-scoped resource
    pub fn cloud_id(&self, kind: &str, name: &str) -> ResourceId {
        ResourceId::new(kind, name)
    }

    /// Identity of a cluster-side resource on the current target
    pub fn cluster_id(&self, kind: &str, namespace: &str, name: &str) -> ResourceId {
        ResourceId::new(kind, format!("{}/{}", namespace, name)).with_target(self.target.as_deref())
    }

    /// Project segment of fully-qualified resource paths (number when known)
    pub fn project_path(&self) -> &str {
        self.project_number.as_deref().unwrap_or(&self.project)
    }

    /// Workload identity pool of the project
    pub fn workload_pool(&self) -> String {
        format!("{}.svc.id.goog", self.project)
    }
}

//! Declarative suite description
//!
//! ```yaml
//! name: orders
//! namespace: orders
//! image: europe-docker.pkg.dev/acme/apps/orders
//! tag: 2024-06-01-abcdef12
//! serviceAccount: orders@acme-prod.iam.gserviceaccount.com
//! secrets:
//!   databaseUrl: postgres://...
//! apps:
//!   - name: api
//!     ports: [{ name: http, port: 80, targetPort: 8080 }]
//! migrations:
//!   command: ["./migrate"]
//! crons:
//!   - name: cleanup
//!     schedule: "0 3 * * *"
//!     command: ["./cleanup"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use keel_cdc::DebeziumDescriptor;
use keel_common::config::StackConfig;
use keel_common::{Error, Result};
use keel_workload::app::AutoscalingMetric;
use keel_workload::{ConcurrencyPolicy, PortSpec, Replicas, Resources, ServiceOptions, SpotPolicy};
use serde::Deserialize;

/// Default dotenv file read in adhoc environments
pub const DEFAULT_DOTENV_PATH: &str = ".env";

/// A suite: one image, many deployables
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuiteDescriptor {
    /// Suite name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Image repository
    pub image: String,
    /// Image tag
    pub tag: String,
    /// Cloud service account email the suite runs as
    #[serde(default)]
    pub service_account: Option<String>,
    /// Env vars for every container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Suite secret values (camelCase keys become ENV_VAR names)
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    /// Further named secrets
    #[serde(default)]
    pub additional_secrets: BTreeMap<String, BTreeMap<String, String>>,
    /// Dotenv file for adhoc environments
    #[serde(default)]
    pub dotenv_path: Option<PathBuf>,
    /// Deployable apps
    #[serde(default)]
    pub apps: Vec<AppDescriptor>,
    /// Migration job(s)
    #[serde(default)]
    pub migrations: Option<Migrations>,
    /// CDC pipeline
    #[serde(default)]
    pub cdc: Option<DebeziumDescriptor>,
    /// Scheduled jobs
    #[serde(default)]
    pub crons: Vec<CronDescriptor>,
    /// Default spot policy
    #[serde(default)]
    pub spot: SpotPolicy,
    /// Default GKE node pool
    #[serde(default)]
    pub node_pool: Option<String>,
}

impl SuiteDescriptor {
    /// Parse a suite from YAML
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Load a suite from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        Self::from_yaml_str(&text)
    }

    /// Read a suite stored under `key` in the stack configuration
    pub fn from_config(config: &StackConfig, key: &str) -> Result<Self> {
        config.get_object(key)?.ok_or_else(|| {
            Error::config("suite", format!("stack configuration has no suite under '{}'", key))
        })
    }

    /// Full image reference
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Dotenv path, defaulting to `.env`
    pub fn dotenv_path(&self) -> PathBuf {
        self.dotenv_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOTENV_PATH))
    }
}

/// One deployable unit
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppDescriptor {
    /// App name, unique within the suite
    pub name: String,
    /// Command override
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Args
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// App-specific env vars; override suite env
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resources
    #[serde(default)]
    pub resources: Resources,
    /// Replica bounds
    #[serde(default)]
    pub replicas: Replicas,
    /// Autoscaling metrics
    #[serde(default)]
    pub metrics: Vec<AutoscalingMetric>,
    /// Service ports
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Service exposure
    #[serde(default)]
    pub service: Option<ServiceOptions>,
    /// preStop delay
    #[serde(default)]
    pub termination_delay_seconds: Option<u32>,
    /// Spot policy; suite default when unset
    #[serde(default)]
    pub spot: Option<SpotPolicy>,
    /// Node pool; suite default when unset
    #[serde(default)]
    pub node_pool: Option<String>,
}

/// A run-to-completion migration
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MigrationDescriptor {
    /// Command
    pub command: Vec<String>,
    /// Args
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Extra env vars
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resources
    #[serde(default)]
    pub resources: Resources,
    /// Retries
    #[serde(default)]
    pub backoff_limit: Option<u32>,
}

/// A single migration or migrations keyed by name
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Migrations {
    /// One migration
    Single(MigrationDescriptor),
    /// Several migrations, one job each
    Keyed(BTreeMap<String, MigrationDescriptor>),
}

impl Migrations {
    /// Base job name and descriptor for each migration
    pub fn entries<'a>(&'a self, suite: &str) -> Vec<(String, &'a MigrationDescriptor)> {
        match self {
            Migrations::Single(d) => vec![(format!("{}-migrate", suite), d)],
            Migrations::Keyed(map) => map
                .iter()
                .map(|(key, d)| (format!("{}-{}-migrate", suite, key), d))
                .collect(),
        }
    }
}

/// A scheduled job sharing the suite image and identity
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronDescriptor {
    /// Cron name
    pub name: String,
    /// Cron expression
    pub schedule: String,
    /// Suspend
    #[serde(default)]
    pub suspend: bool,
    /// Concurrency policy
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    /// Command
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Args
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Extra env vars
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resources
    #[serde(default)]
    pub resources: Resources,
    /// Retries per run
    #[serde(default)]
    pub backoff_limit: Option<u32>,
    /// Spot policy; suite default when unset
    #[serde(default)]
    pub spot: Option<SpotPolicy>,
}

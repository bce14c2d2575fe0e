//! Keel - infrastructure composition for application suites on GKE and GCP
//!
//! Keel builds a resource graph: typed declarations with explicit
//! dependency edges, handed to an external orchestration engine that owns
//! diffing and applying. Adhoc environments swap managed cloud resources
//! for local stand-ins realised by dynamic providers.
//!
//! # Crates
//!
//! - [`common`] - graph, deploy context, errors, naming, hashing, config
//! - [`gcp`] - Cloud Run, Pub/Sub, Scheduler, Secret Manager, SQL, IAM
//! - [`workload`] - Kubernetes apps, jobs, crons, secrets, spot scheduling
//! - [`cache`] - Redis releases
//! - [`cdc`] - Debezium change data capture
//! - [`emulator`] - local dynamic providers and applier
//! - [`suite`] - application-suite orchestration

#![deny(missing_docs)]

pub use keel_cache as cache;
pub use keel_cdc as cdc;
pub use keel_common as common;
pub use keel_emulator as emulator;
pub use keel_gcp as gcp;
pub use keel_suite as suite;
pub use keel_workload as workload;

pub use keel_common::{
    Backend, DeployContext, Environment, Error, ResourceGraph, ResourceId, ResourceRef, Result,
};
pub use keel_suite::{deploy_app_suite, DeployTarget, SuiteDeployment, SuiteDescriptor};

//! Kubernetes workload composition for keel
//!
//! Apps compile to a Deployment plus, in managed environments, an autoscaler
//! and disruption budget. Jobs and crons share the same pod pipeline, and
//! every pod template goes through the spot scheduling computation.

#![deny(missing_docs)]

pub mod app;
pub mod cron;
pub mod identity;
pub mod job;
pub mod k8s;
pub mod pod;
pub mod secret;
pub mod spot;

pub use app::{compile_app, AppHandle, AppOptions, PortSpec, Replicas, ServiceOptions};
pub use cron::{create_cron_job, ConcurrencyPolicy, CronOptions};
pub use identity::{bind_workload_identity, WorkloadIdentity, WorkloadIdentityOptions};
pub use job::{create_migration_job, MigrationJobOptions};
pub use pod::{ContainerOptions, Resources};
pub use secret::{create_secret, SecretOptions, SecretRef};
pub use spot::{SpotPolicy, SpotScheduling};

#[cfg(test)]
pub(crate) mod test_support {
    use keel_common::{DeployContext, Environment};

    pub fn managed() -> DeployContext {
        DeployContext::new("acme-prod", "europe-west1", Environment::Managed).for_target("primary")
    }

    pub fn adhoc() -> DeployContext {
        DeployContext::new("acme-dev", "europe-west1", Environment::Adhoc).for_target("local")
    }
}

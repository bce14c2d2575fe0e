//! Application-suite orchestration for keel
//!
//! [`deploy_app_suite`] is the composition root: it turns a
//! [`SuiteDescriptor`] into identity, secrets, migrations, CDC, apps and
//! crons on one or more target clusters, threading dependencies forward so
//! the orchestration engine creates them in order.

#![deny(missing_docs)]

pub mod descriptor;
pub mod orchestrator;
pub mod target;

pub use descriptor::{
    AppDescriptor, CronDescriptor, MigrationDescriptor, Migrations, SuiteDescriptor,
    DEFAULT_DOTENV_PATH,
};
pub use orchestrator::{deploy_app_suite, SuiteDeployment, TargetDeployment};
pub use target::{validate_targets, DeployTarget};

//! GCP resource constructors
//!
//! Each constructor translates a typed options struct into provider
//! declarations on a [`ResourceGraph`](keel_common::ResourceGraph). Where a
//! local stand-in exists (Pub/Sub emulator, local SQL server) the adhoc branch
//! declares a [`Backend::Local`](keel_common::Backend::Local) resource instead.

pub mod cloud_run;
pub mod iam;
pub mod pubsub;
pub mod scheduler;
pub mod secret_manager;
pub mod sql;

pub use cloud_run::{create_service, CloudRunHandle, CloudRunOptions, InvokerAccess};
pub use iam::{
    create_service_account, service_account_email, CloudServiceAccount, ServiceAccountHandle,
    ServiceAccountOptions,
};
pub use pubsub::{create_subscription, create_topic, Delivery, SubscriptionOptions, TopicHandle};
pub use secret_manager::{create_secrets, parse_version_suffix, SecretHandle, SecretsOptions};
pub use sql::{DatabaseEngine, LocalSqlConnection, SqlInstance};

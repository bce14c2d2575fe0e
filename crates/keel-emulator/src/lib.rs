//! Local dynamic providers for keel
//!
//! Adhoc environments declare topics, subscriptions and databases as local
//! resources. This crate realises them against a Pub/Sub emulator and a
//! local SQL server: existence is checked first and creation tolerates
//! "already exists". Nothing here retries; a failure surfaces to the
//! operator as a provider error.

#![deny(missing_docs)]

pub mod applier;
pub mod context;
pub mod error;
pub mod providers;
pub mod pubsub;
pub mod sql;

use std::sync::Arc;

use keel_common::config::StackConfig;
use keel_common::{ResourceGraph, Result};

pub use applier::{AppliedResource, AppliedState, ApplySummary, DynamicApplier};
pub use context::LocalContext;
pub use error::{EmulatorError, EmulatorResult};
pub use providers::{local_providers, LocalDatabaseProvider, LocalSubscriptionProvider, LocalTopicProvider};
pub use pubsub::{EmulatorPubSub, PubSubAdmin, SubscriptionSpec};
pub use sql::{LocalSqlServer, SqlAdmin};

/// Apply the local declarations of `graph` with clients for the stack's
/// emulator endpoints
pub async fn apply_local(
    graph: &ResourceGraph,
    config: &StackConfig,
    state: &mut AppliedState,
) -> Result<ApplySummary> {
    let ctx = Arc::new(LocalContext::from_config(config));
    DynamicApplier::with_providers(local_providers(ctx))
        .apply(graph, state)
        .await
}

//! Change data capture for keel suites
//!
//! A Debezium server reads the database log and publishes change events to
//! a Pub/Sub topic.

#![deny(missing_docs)]

pub mod debezium;
pub mod properties;

pub use debezium::{
    create_debezium_dependencies, deploy_debezium, DebeziumDependencies,
    DebeziumDependencyOptions, DebeziumDescriptor, DebeziumHandle, DebeziumOptions,
};
pub use properties::{load_template, render_properties, render_properties_strict};

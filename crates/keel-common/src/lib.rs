//! Common types for keel: resource graph, errors, naming, and configuration

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod dotenv;
pub mod dynamic;
pub mod error;
pub mod graph;
pub mod hash;
pub mod meta;
pub mod naming;
pub mod telemetry;

pub use context::{Backend, DeployContext, Environment};
pub use error::Error;
pub use graph::{Declaration, ResourceGraph, ResourceId, ResourceRef};
pub use meta::ObjectMeta;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Standard Kubernetes name label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Label identifying the suite a resource belongs to
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Label identifying the component inside a suite (api, worker, migration)
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for the managed-by label
pub const LABEL_MANAGED_BY_KEEL: &str = "keel";

/// Annotation prefix for keel-owned annotations
pub const ANNOTATION_PREFIX: &str = "keel.dev";

/// Pod annotation carrying the hash of suite secrets
pub const ANNOTATION_SECRETS_CHECKSUM: &str = "keel.dev/secrets-checksum";

/// Pod annotation carrying the hash of the local dotenv file
pub const ANNOTATION_DOTENV_CHECKSUM: &str = "keel.dev/dotenv-checksum";

/// Pod annotation carrying the hash of rendered CDC properties
pub const ANNOTATION_PROPS_CHECKSUM: &str = "keel.dev/props-checksum";

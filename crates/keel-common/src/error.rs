//! Error types for keel
//!
//! Errors are raised while the resource graph is being built, before any
//! declaration of the failing branch reaches the orchestration engine.
//! Each variant carries the component that raised it.

use thiserror::Error;

use crate::graph::ResourceId;

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or conflicting configuration supplied by the caller
    #[error("configuration error [{context}]: {message}")]
    Config {
        /// Component that rejected the configuration (e.g. "redis", "pubsub")
        context: String,
        /// Description of what's invalid
        message: String,
    },

    /// A resource with the same identity was already declared
    #[error("duplicate resource declaration: {id}")]
    DuplicateResource {
        /// Identity of the resource declared twice
        id: ResourceId,
    },

    /// A declaration depends on a resource that was never declared
    #[error("{id} depends on undeclared resource {dependency}")]
    UnknownDependency {
        /// Declaration holding the dangling edge
        id: ResourceId,
        /// The missing dependency
        dependency: ResourceId,
    },

    /// Upstream provider or local emulator failure
    #[error("provider error [{provider}]: {message}")]
    Provider {
        /// Provider that failed (e.g. "local-pubsub", "local-sql")
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// A provider-formatted string did not have the expected shape
    #[error("unexpected format for {what}: '{value}'")]
    Format {
        /// What was being parsed
        what: String,
        /// The offending value
        value: String,
    },

    /// Filesystem error while reading an input template or dotenv file
    #[error("io error reading {path}: {source}")]
    Io {
        /// File being read
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a configuration error for the given component
    pub fn config(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a provider error
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a format error
    pub fn format(what: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Format {
            what: what.into(),
            value: value.into(),
        }
    }

    /// Create an io error for a path
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_names_component() {
        let err = Error::config("redis", "storage smaller than memory");
        assert_eq!(
            err.to_string(),
            "configuration error [redis]: storage smaller than memory"
        );
        assert!(err.is_config());
    }

    #[test]
    fn provider_error_is_not_config() {
        let err = Error::provider("local-sql", "connection refused");
        assert!(!err.is_config());
        assert!(err.to_string().contains("local-sql"));
    }
}

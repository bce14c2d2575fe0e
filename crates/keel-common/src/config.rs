//! Stack-scoped configuration
//!
//! The stack configuration is read once per deployment program and never
//! written. Arbitrary keys (image tags, feature flags, secret objects) live
//! under `values` and are read through typed accessors.
//!
//! ```yaml
//! project: acme-prod
//! projectNumber: "123456789"
//! region: europe-west1
//! environment: managed
//! emulators:
//!   pubsub: http://localhost:8085
//! values:
//!   imageTag: 2024-06-01-abcdef12
//!   ordersSecrets:
//!     databaseUrl: postgres://...
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::Value;

use crate::context::Environment;
use crate::{Error, Result};

const CONTEXT: &str = "stack-config";

fn default_region() -> String {
    "europe-west1".to_string()
}

/// Local emulator endpoints for adhoc environments
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmulatorEndpoints {
    /// Pub/Sub emulator base URL (e.g. `http://localhost:8085`)
    #[serde(default)]
    pub pubsub: Option<String>,
    /// Postgres connection URL for the local server
    #[serde(default)]
    pub postgres: Option<String>,
    /// MySQL connection URL for the local server
    #[serde(default)]
    pub mysql: Option<String>,
}

/// Stack configuration object
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    /// GCP project id
    pub project: String,
    /// GCP project number (used in fully-qualified resource paths)
    #[serde(default)]
    pub project_number: Option<String>,
    /// GCP region
    #[serde(default = "default_region")]
    pub region: String,
    /// Target environment
    #[serde(default)]
    pub environment: Environment,
    /// Local emulator endpoints
    #[serde(default)]
    pub emulators: EmulatorEndpoints,
    /// Arbitrary stack values
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl StackConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        Self::from_yaml_str(&text)
    }

    /// String value for a key, if set
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(scalar_to_string)
    }

    /// String value for a key, failing if absent
    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key)
            .ok_or_else(|| Error::config(CONTEXT, format!("missing required key '{}'", key)))
    }

    /// Boolean value for a key (`false` when absent)
    pub fn get_bool(&self, key: &str) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Deserialize a structured value, if set
    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            Some(value) => Ok(Some(serde_yaml::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Flat key/value secret object; scalars are stringified, nested values rejected
    pub fn secret_values(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let Some(value) = self.values.get(key) else {
            return Ok(BTreeMap::new());
        };
        let mapping = value.as_mapping().ok_or_else(|| {
            Error::config(CONTEXT, format!("'{}' must be a mapping of secret values", key))
        })?;

        let mut out = BTreeMap::new();
        for (k, v) in mapping {
            let k = scalar_to_string(k)
                .ok_or_else(|| Error::config(CONTEXT, format!("'{}' has a non-scalar key", key)))?;
            let v = scalar_to_string(v).ok_or_else(|| {
                Error::config(CONTEXT, format!("secret '{}.{}' must be a scalar", key, k))
            })?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

/// Outputs exported by another stack
#[derive(Clone, Debug)]
pub struct StackReference {
    /// Referenced stack name
    pub stack: String,
    outputs: BTreeMap<String, Value>,
}

impl StackReference {
    /// Parse exported outputs from YAML text
    pub fn from_yaml_str(stack: impl Into<String>, input: &str) -> Result<Self> {
        Ok(Self {
            stack: stack.into(),
            outputs: serde_yaml::from_str(input)?,
        })
    }

    /// Load exported outputs from a YAML file
    pub fn from_file(stack: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        Self::from_yaml_str(stack, &text)
    }

    /// String output, failing if the stack does not export it
    pub fn require_output(&self, key: &str) -> Result<String> {
        self.outputs
            .get(key)
            .and_then(scalar_to_string)
            .ok_or_else(|| {
                Error::config(
                    CONTEXT,
                    format!("stack '{}' does not export '{}'", self.stack, key),
                )
            })
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
project: acme-dev
projectNumber: "42"
environment: adhoc
emulators:
  pubsub: http://localhost:8085
values:
  imageTag: build-17
  replicas: 3
  cdnEnabled: true
  ordersSecrets:
    databaseUrl: postgres://local
    retries: 5
  nested:
    inner:
      deep: 1
"#;

    #[test]
    fn parses_sample_config() {
        let config = StackConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.project, "acme-dev");
        assert_eq!(config.region, "europe-west1");
        assert_eq!(config.environment, Environment::Adhoc);
        assert_eq!(
            config.emulators.pubsub.as_deref(),
            Some("http://localhost:8085")
        );
        assert_eq!(config.get_str("imageTag").as_deref(), Some("build-17"));
        assert_eq!(config.get_str("replicas").as_deref(), Some("3"));
        assert!(config.get_bool("cdnEnabled"));
        assert!(!config.get_bool("missing"));
    }

    #[test]
    fn require_str_fails_on_missing_key() {
        let config = StackConfig::from_yaml_str(SAMPLE).unwrap();
        let err = config.require_str("nope").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn secret_values_are_stringified() {
        let config = StackConfig::from_yaml_str(SAMPLE).unwrap();
        let secrets = config.secret_values("ordersSecrets").unwrap();
        assert_eq!(secrets.get("databaseUrl").unwrap(), "postgres://local");
        assert_eq!(secrets.get("retries").unwrap(), "5");
        assert!(config.secret_values("absent").unwrap().is_empty());
        assert!(config.secret_values("nested").is_err());
    }

    #[test]
    fn stack_reference_reads_outputs() {
        let reference =
            StackReference::from_yaml_str("shared", "invokerEmail: push@acme.iam.gserviceaccount.com\n")
                .unwrap();
        assert_eq!(
            reference.require_output("invokerEmail").unwrap(),
            "push@acme.iam.gserviceaccount.com"
        );
        assert!(reference.require_output("other").is_err());
    }
}

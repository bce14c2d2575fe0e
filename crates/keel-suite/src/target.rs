//! Deploy targets
//!
//! A suite can be replayed onto several clusters. Exactly one is primary:
//! it alone declares migrations, CDC and the workload identity binding, so
//! non-idempotent side effects happen once.

use std::collections::BTreeSet;

use keel_common::{DeployContext, Error, Result};

const CONTEXT: &str = "suite";

/// Cluster a suite is deployed to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployTarget {
    /// Target name, used to scope cluster-side declarations
    pub name: String,
    /// Owns migrations, CDC and identity binding
    pub primary: bool,
}

impl DeployTarget {
    /// The primary target
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary: true,
        }
    }

    /// A replica target
    pub fn replica(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary: false,
        }
    }
}

/// Check the target list before anything is declared
pub fn validate_targets(ctx: &DeployContext, targets: &[DeployTarget]) -> Result<()> {
    if targets.is_empty() {
        return Err(Error::config(CONTEXT, "at least one deploy target is required"));
    }
    if ctx.is_adhoc() && targets.len() != 1 {
        return Err(Error::config(
            CONTEXT,
            format!(
                "adhoc environments deploy to exactly one target, got {}",
                targets.len()
            ),
        ));
    }

    let primaries = targets.iter().filter(|t| t.primary).count();
    if primaries != 1 {
        return Err(Error::config(
            CONTEXT,
            format!("exactly one primary target is required, got {}", primaries),
        ));
    }

    let mut seen = BTreeSet::new();
    for target in targets {
        if !seen.insert(target.name.as_str()) {
            return Err(Error::config(
                CONTEXT,
                format!("duplicate deploy target '{}'", target.name),
            ));
        }
    }
    Ok(())
}

//! Naming and label helpers
//!
//! Pure string transforms shared by every constructor: secret keys become
//! environment variable names, image tags become migration job suffixes,
//! and label sources merge in a fixed order.

use std::collections::BTreeMap;

/// GKE node pool label key
pub const NODE_POOL_LABEL: &str = "cloud.google.com/gke-nodepool";

/// Number of trailing tag characters used in migration job names
const MIGRATION_SUFFIX_LEN: usize = 8;

/// Convert a camelCase key into an ENV_VAR name.
///
/// An underscore is inserted at every lower-to-upper boundary and the result
/// is uppercased, so `memorySizeGb` becomes `MEMORY_SIZE_GB`. Input that is
/// already in ENV_VAR form is returned unchanged.
///
/// A run of capitals is one word: no underscore goes between two uppercase
/// letters, so `APIKey` becomes `APIKEY` and `mixedCASEKey` becomes
/// `MIXED_CASEKEY`.
pub fn camel_to_underscore(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev: Option<char> = None;
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            if let Some(p) = prev {
                if p.is_ascii_lowercase() || p.is_ascii_digit() {
                    out.push('_');
                }
            }
        }
        out.push(c.to_ascii_uppercase());
        prev = Some(c);
    }
    out
}

/// Derive a migration job name from a base name and a container image.
///
/// Uses the last 8 characters of the text after the final `:` of the image
/// reference. Shorter tags are used whole. The suffix is lowercased and any
/// character outside `[a-z0-9-]` becomes `-`.
pub fn migration_job_name(base: &str, image: &str) -> String {
    let tag = image.rsplit(':').next().unwrap_or(image);
    let chars: Vec<char> = tag.chars().collect();
    let start = chars.len().saturating_sub(MIGRATION_SUFFIX_LEN);
    let suffix: String = chars[start..]
        .iter()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let suffix = suffix.trim_matches('-');
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{}-{}", base, suffix)
    }
}

/// Join a base resource name and a suffix with `-`
pub fn resource_name(base: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{}-{}", base, suffix)
    }
}

/// Merge label maps in order; later sources override earlier ones on collision
pub fn merge_labels<'a, I>(sources: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    let mut merged = BTreeMap::new();
    for source in sources {
        for (k, v) in source {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Node selector labels pinning pods to a GKE node pool
pub fn node_labels(pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(NODE_POOL_LABEL.to_string(), pool.to_string())])
}

/// Standard labels for a component of a suite
pub fn suite_labels(suite: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (crate::LABEL_PART_OF.to_string(), suite.to_string()),
        (crate::LABEL_COMPONENT.to_string(), component.to_string()),
    ])
}

//! Content checksums used as rollout triggers
//!
//! A checksum is placed on a pod template annotation; when the hashed
//! content changes the pod template changes and the workload rolls, even
//! though the referenced Secret keeps its name.

use std::collections::BTreeMap;

use aws_lc_rs::digest::{digest, SHA256};

/// Number of digest bytes kept in a checksum (16 hex chars)
const CHECKSUM_BYTES: usize = 8;

/// SHA-256 of arbitrary content, truncated to 16 lowercase hex characters
pub fn content_hash(data: &[u8]) -> String {
    let hash = digest(&SHA256, data);
    hash.as_ref()
        .iter()
        .take(CHECKSUM_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Checksum of a key/value map in key order
pub fn map_hash(data: &BTreeMap<String, String>) -> String {
    let mut buf = String::new();
    for (k, v) in data {
        buf.push_str(k);
        buf.push('=');
        buf.push_str(v);
        buf.push('\n');
    }
    content_hash(buf.as_bytes())
}

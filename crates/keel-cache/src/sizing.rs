//! Memory and storage sizing

use keel_common::{Error, Result};
use serde::Serialize;

/// Smallest persistent volume, in GiB
pub const MIN_STORAGE_GB: u32 = 10;
/// Headroom added to the requested memory for the container limit
const MEMORY_LIMIT_HEADROOM: f64 = 1.1;

/// Persistent volume settings for the chart
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    /// Enabled
    pub enabled: bool,
    /// Size (e.g. `20Gi`)
    pub size: String,
}

/// Sizing inputs
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SizingOptions {
    /// Requested memory in GiB
    pub memory_size_gb: f64,
    /// Explicit storage in GiB
    pub storage_size_gb: Option<u32>,
}

/// Storage in GiB: explicit, or `max(10, 2 x memory)`
pub fn storage_size_gb(opts: &SizingOptions) -> u32 {
    opts.storage_size_gb
        .unwrap_or_else(|| MIN_STORAGE_GB.max((opts.memory_size_gb * 2.0).ceil() as u32))
}

/// Persistence settings. Memory larger than storage is rejected.
pub fn configure_persistence(opts: &SizingOptions) -> Result<Persistence> {
    if opts.memory_size_gb.is_nan() || opts.memory_size_gb <= 0.0 {
        return Err(Error::config(
            "redis",
            format!("memory size must be positive, got {}", opts.memory_size_gb),
        ));
    }
    let storage = storage_size_gb(opts);
    if opts.memory_size_gb > f64::from(storage) {
        return Err(Error::config(
            "redis",
            format!(
                "memory size {}GB exceeds storage size {}GB",
                opts.memory_size_gb, storage
            ),
        ));
    }
    Ok(Persistence {
        enabled: true,
        size: format!("{}Gi", storage),
    })
}

/// Container memory limit: requested memory plus 10%, in MiB
pub fn memory_limit(memory_size_gb: f64) -> String {
    format!("{}Mi", (memory_size_gb * 1024.0 * MEMORY_LIMIT_HEADROOM).round() as u64)
}

/// Container memory request, in MiB
pub fn memory_request(memory_size_gb: f64) -> String {
    format!("{}Mi", (memory_size_gb * 1024.0).round() as u64)
}

//! redis.conf rendering

use std::collections::BTreeMap;

use keel_common::{Error, Result};

/// Share of requested memory given to `maxmemory` when not set explicitly
pub const DEFAULT_MAXMEMORY_PERCENT: u32 = 80;

const LOADMODULE: &str = "loadmodule";
const MAXMEMORY: &str = "maxmemory";

/// Inputs for [`build_configuration`]
#[derive(Clone, Debug, Default)]
pub struct ConfigurationOptions {
    /// Directives (`key value` per line)
    pub configuration: BTreeMap<String, String>,
    /// Module paths, one `loadmodule` line each
    pub modules: Vec<String>,
    /// Requested memory in GiB
    pub memory_size_gb: f64,
    /// Share of memory for `maxmemory`; defaults to 80
    pub maxmemory_percent: Option<u32>,
}

fn has_key(configuration: &BTreeMap<String, String>, key: &str) -> bool {
    configuration.keys().any(|k| k.eq_ignore_ascii_case(key))
}

/// Render the configuration text.
///
/// Modules must come from the dedicated list; a `loadmodule` directive in
/// the configuration map together with modules is rejected.
pub fn build_configuration(opts: &ConfigurationOptions) -> Result<String> {
    if has_key(&opts.configuration, LOADMODULE) && !opts.modules.is_empty() {
        return Err(Error::config(
            "redis",
            "set modules either through the modules list or a loadmodule directive, not both",
        ));
    }

    let mut lines: Vec<String> = opts
        .configuration
        .iter()
        .map(|(k, v)| format!("{} {}", k, v))
        .collect();
    lines.extend(opts.modules.iter().map(|m| format!("{} {}", LOADMODULE, m)));

    if !has_key(&opts.configuration, MAXMEMORY) {
        let percent = opts.maxmemory_percent.unwrap_or(DEFAULT_MAXMEMORY_PERCENT);
        if percent == 0 || percent > 100 {
            return Err(Error::config(
                "redis",
                format!("maxmemory percent must be within 1..=100, got {}", percent),
            ));
        }
        let mb = (opts.memory_size_gb * 1024.0 * f64::from(percent) / 100.0).round() as u64;
        lines.push(format!("{} {}mb", MAXMEMORY, mb));
    }

    Ok(lines.join("\n"))
}

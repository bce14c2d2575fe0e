//! Redis releases for keel
//!
//! Sizing and configuration rendering are pure functions so they can be
//! checked without a graph; [`create_redis`] composes them into a Helm
//! release declaration.

#![deny(missing_docs)]

pub mod config;
pub mod release;
pub mod sizing;

pub use config::{build_configuration, ConfigurationOptions, DEFAULT_MAXMEMORY_PERCENT};
pub use release::{create_redis, RedisArchitecture, RedisHandle, RedisOptions};
pub use sizing::{configure_persistence, memory_limit, Persistence, SizingOptions};

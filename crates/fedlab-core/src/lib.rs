//! fedlab-core — configuration shared by every fedlab crate.
//!
//! The daemon reads a single `fedlab.toml`; every section is optional and
//! falls back to defaults, so an empty file is a valid configuration.

pub mod config;
pub mod error;

pub use config::{
    parse_duration, FedlabConfig, FeedConfig, PathsConfig, ServerConfig, StoreConfig,
    WorkerConfig,
};
pub use error::{ConfigError, ConfigResult};

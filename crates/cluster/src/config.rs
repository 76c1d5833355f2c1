//! Cluster timing and reduction settings.
//!
//! Read from the `[cluster]` section of `s2gpp.toml`; every key is optional
//! and can be overridden with `S2GPP_CLUSTER_<KEY>`.

mod loading;
mod types;
mod validation;


pub use loading::DEFAULT_CONFIG_FILE;
pub use types::ClusterConfig;
pub use validation::MAX_TIMEOUT_SECS;

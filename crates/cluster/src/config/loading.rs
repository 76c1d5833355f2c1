use std::path::Path;

use tracing::{debug, info};

use crate::error::ClusterError;

use super::types::{ClusterConfig, ConfigFile};

/// Looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "s2gpp.toml";

impl ClusterConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ClusterError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = file.cluster;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else `s2gpp.toml` if present, else defaults.
    /// Environment overrides and validation apply in every case.
    pub fn load(path: Option<&Path>) -> Result<Self, ClusterError> {
        match path {
            Some(path) => {
                info!(path = %path.display(), "loading cluster config");
                Self::from_file(path)
            }
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                info!(path = DEFAULT_CONFIG_FILE, "loading cluster config");
                Self::from_file(DEFAULT_CONFIG_FILE)
            }
            None => {
                debug!("no cluster config file, using defaults");
                let mut config = Self::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `S2GPP_CLUSTER_KEY` overrides `cluster.key`.
    /// Examples:
    /// - `S2GPP_CLUSTER_ACCEPT_TIMEOUT_SECS` -> `cluster.accept_timeout_secs`
    /// - `S2GPP_CLUSTER_CONNECT_ATTEMPTS` -> `cluster.connect_attempts`
    /// - `S2GPP_CLUSTER_REDUCTION` -> `cluster.reduction`
    ///
    /// Unparsable values are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse().ok());

        if let Some(v) = parsed("S2GPP_CLUSTER_ACCEPT_TIMEOUT_SECS") {
            self.accept_timeout_secs = v;
        }
        if let Some(v) = parsed("S2GPP_CLUSTER_HANDSHAKE_TIMEOUT_SECS") {
            self.handshake_timeout_secs = v;
        }
        if let Some(v) = parsed("S2GPP_CLUSTER_ASSIGNMENT_TIMEOUT_SECS") {
            self.assignment_timeout_secs = v;
        }
        if let Some(v) = parsed("S2GPP_CLUSTER_DISPATCH_TIMEOUT_SECS") {
            self.dispatch_timeout_secs = v;
        }
        if let Some(v) = parsed("S2GPP_CLUSTER_REPORT_TIMEOUT_SECS") {
            self.report_timeout_secs = v;
        }
        if let Some(v) = parsed("S2GPP_CLUSTER_COLLECT_TIMEOUT_SECS") {
            self.collect_timeout_secs = v;
        }
        if let Some(v) = lookup("S2GPP_CLUSTER_CONNECT_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            self.connect_attempts = v;
        }
        if let Some(v) = parsed("S2GPP_CLUSTER_CONNECT_BACKOFF_MS") {
            self.connect_backoff_ms = v;
        }
        if let Some(v) = parsed("S2GPP_CLUSTER_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = lookup("S2GPP_CLUSTER_REDUCTION").and_then(|v| v.parse().ok()) {
            self.reduction = v;
        }
    }
}

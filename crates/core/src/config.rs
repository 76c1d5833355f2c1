use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::params::{ClusteringMethod, ParameterInput};
use crate::topology::ColumnBounds;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

/// Parse a profiled env var. A value that is set but does not parse is
/// logged and treated as unset.
fn profiled_env_parse<T>(profile: &str, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = profiled_env_opt(profile, key)?;
    parse_setting(key, &raw)
}

fn parse_setting<T>(key: &str, raw: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = raw, error = %e, "ignoring unparsable setting, using the default");
            None
        }
    }
}

fn parse_flag(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = raw, "ignoring unparsable flag, using the default");
            None
        }
    }
}

fn profiled_env_flag(profile: &str, key: &str) -> Option<bool> {
    let raw = profiled_env_opt(profile, key)?;
    parse_flag(key, &raw)
}

// ── Top-level config ──────────────────────────────────────────

/// Run defaults taken from the environment; CLI flags override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub model: ParameterInput,
    pub node: NodeConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `S2GPP_PROFILE`. When set (e.g. `BENCH`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("S2GPP_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            model: model_from_env_profiled(p),
            node: NodeConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  model:  pattern_length={}, rate={}, threads={}, clustering={}",
            self.model.pattern_length,
            self.model.rate,
            self.model.n_threads,
            self.model.clustering
        );
        tracing::info!(
            "  node:   local_host={}, cluster_nodes={}, mainhost={}",
            self.node.local_host,
            self.node.n_cluster_nodes,
            self.node.mainhost.as_deref().unwrap_or("(none)")
        );
    }

    /// JSON view of the effective configuration.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "model": self.model,
            "node": {
                "local_host": self.node.local_host,
                "mainhost": self.node.mainhost,
                "n_cluster_nodes": self.node.n_cluster_nodes,
                "columns": { "start": self.node.columns.start, "end": self.node.columns.end },
                "output_path": self.node.output_path,
            },
        })
    }
}

// ── Model ─────────────────────────────────────────────────────

fn model_from_env_profiled(p: &str) -> ParameterInput {
    let defaults = ParameterInput::default();
    ParameterInput {
        pattern_length: profiled_env_parse(p, "S2GPP_PATTERN_LENGTH")
            .unwrap_or(defaults.pattern_length),
        latent: profiled_env_parse(p, "S2GPP_LATENT"),
        rate: profiled_env_parse(p, "S2GPP_RATE").unwrap_or(defaults.rate),
        query_length: profiled_env_parse(p, "S2GPP_QUERY_LENGTH"),
        n_threads: profiled_env_parse(p, "S2GPP_THREADS").unwrap_or(defaults.n_threads),
        clustering: profiled_env_parse::<ClusteringMethod>(p, "S2GPP_CLUSTERING")
            .unwrap_or(defaults.clustering),
        self_correction: profiled_env_flag(p, "S2GPP_SELF_CORRECTION")
            .unwrap_or(defaults.self_correction),
    }
}

// ── Node ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// `host:port` this node binds (main) or advertises (sub).
    pub local_host: String,
    /// Coordinator `host:port`, sub nodes only.
    pub mainhost: Option<String>,
    pub n_cluster_nodes: usize,
    pub columns: ColumnBounds,
    pub output_path: PathBuf,
}

impl NodeConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            local_host: profiled_env_or(p, "S2GPP_LOCAL_HOST", "127.0.0.1:1992"),
            mainhost: profiled_env_opt(p, "S2GPP_MAINHOST"),
            n_cluster_nodes: profiled_env_parse(p, "S2GPP_CLUSTER_NODES").unwrap_or(1),
            columns: ColumnBounds::new(
                profiled_env_parse(p, "S2GPP_COLUMN_START_IDX").unwrap_or(0),
                profiled_env_parse(p, "S2GPP_COLUMN_END_IDX").unwrap_or(0),
            ),
            output_path: PathBuf::from(profiled_env_or(
                p,
                "S2GPP_SCORE_OUTPUT_PATH",
                "anomaly_scores.ts",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A profile name no other test or environment uses, so the lookups
    // below are isolated from the real environment.
    const PROFILE: &str = "S2GPPCONFIGTEST";

    #[test]
    fn profiled_values_override_defaults() {
        env::set_var("S2GPPCONFIGTEST_S2GPP_PATTERN_LENGTH", "120");
        env::set_var("S2GPPCONFIGTEST_S2GPP_CLUSTERING", "meanshift");
        env::set_var("S2GPPCONFIGTEST_S2GPP_COLUMN_END_IDX", "-2");

        let cfg = Config::for_profile(PROFILE);
        assert_eq!(cfg.profile_label(), PROFILE);
        assert_eq!(cfg.model.pattern_length, 120);
        assert_eq!(cfg.model.clustering, ClusteringMethod::MeanShift);
        assert_eq!(cfg.node.columns.end, -2);

        let summary = cfg.summary();
        assert_eq!(summary["model"]["pattern_length"], 120);
        assert_eq!(summary["model"]["clustering"], "meanshift");
    }

    #[test]
    fn unparsable_values_fall_back() {
        env::set_var("S2GPPBADTEST_S2GPP_RATE", "lots");
        let cfg = Config::for_profile("S2GPPBADTEST");
        assert_eq!(cfg.model.rate, ParameterInput::default().rate);
    }

    #[test]
    fn bad_clustering_and_flag_fall_back() {
        env::set_var("S2GPPFLAGTEST_S2GPP_CLUSTERING", "kmeans");
        env::set_var("S2GPPFLAGTEST_S2GPP_SELF_CORRECTION", "maybe");
        let cfg = Config::for_profile("S2GPPFLAGTEST");
        let defaults = ParameterInput::default();
        assert_eq!(cfg.model.clustering, defaults.clustering);
        assert_eq!(cfg.model.self_correction, defaults.self_correction);
    }

    #[test]
    fn flags_accept_common_spellings() {
        for raw in ["true", "TRUE", "1", "yes", " on "] {
            assert_eq!(parse_flag("K", raw), Some(true), "{raw}");
        }
        for raw in ["false", "0", "No", "off"] {
            assert_eq!(parse_flag("K", raw), Some(false), "{raw}");
        }
        assert_eq!(parse_flag("K", "maybe"), None);
        assert_eq!(parse_setting::<u32>("K", " 42 "), Some(42));
        assert_eq!(parse_setting::<ClusteringMethod>("K", "kmeans"), None);
    }
}

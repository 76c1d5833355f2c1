use std::time::Duration;

use s2gpp_compute::ReductionMode;
use serde::{Deserialize, Serialize};

// ── File layout ─────────────────────────────────────────────────────

/// Top level of `s2gpp.toml`. Only the `[cluster]` section is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ConfigFile {
    #[serde(default)]
    pub cluster: ClusterConfig,
}

// ── Cluster section ─────────────────────────────────────────────────

/// Bounds on every blocking wait of the rendezvous protocol, plus the
/// reduction applied when window scores are reconstructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Main: how long to wait for all sub nodes to register.
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,

    /// Main: how long a fresh connection has to send its hello.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Sub: how long to wait for the assignment after the hello.
    #[serde(default = "default_assignment_timeout")]
    pub assignment_timeout_secs: u64,

    /// Main: bound on handing one sub its assignment.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,

    /// Main: how long to wait for every sub's scores.
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,

    /// Sub: bound on delivering the scores to the coordinator.
    #[serde(default = "default_report_timeout")]
    pub report_timeout_secs: u64,

    /// Sub: dial attempts before giving up on the coordinator.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Sub: pause between dial attempts.
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_ms: u64,

    /// Sub: bound on a single dial attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub reduction: ReductionMode,
}

fn default_accept_timeout() -> u64 {
    300
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_assignment_timeout() -> u64 {
    300
}

fn default_dispatch_timeout() -> u64 {
    60
}

fn default_report_timeout() -> u64 {
    60
}

fn default_collect_timeout() -> u64 {
    3600
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_connect_backoff() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            accept_timeout_secs: default_accept_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            assignment_timeout_secs: default_assignment_timeout(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            collect_timeout_secs: default_collect_timeout(),
            report_timeout_secs: default_report_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff(),
            connect_timeout_secs: default_connect_timeout(),
            reduction: ReductionMode::default(),
        }
    }
}

impl ClusterConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use s2gpp_compute::ComputeError;
use s2gpp_core::{NodeRole, S2gError};
use thiserror::Error;

/// Where a coordination failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub role: NodeRole,
    /// Name of the state the node was in when it failed.
    pub state: &'static str,
    pub peer: Option<SocketAddr>,
}

impl FailureContext {
    pub fn new(role: NodeRole, state: &'static str) -> Self {
        Self {
            role,
            state,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl fmt::Display for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node in {}", self.role, self.state)?;
        if let Some(peer) = self.peer {
            write!(f, ", peer {peer}")?;
        }
        Ok(())
    }
}

/// Errors raised while coordinating a run.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("topology mismatch ({context}): {reason}")]
    TopologyMismatch {
        context: FailureContext,
        reason: String,
    },

    #[error("connection failed ({context}): {reason}")]
    Connection {
        context: FailureContext,
        reason: String,
    },

    #[error("could not deliver results ({context}): {reason}")]
    Uplink {
        context: FailureContext,
        reason: String,
    },

    #[error("timed out after {waited:?} ({context})")]
    Timeout {
        context: FailureContext,
        waited: Duration,
    },

    #[error("run cancelled ({context})")]
    Cancelled { context: FailureContext },

    #[error("protocol violation ({context}): {reason}")]
    Protocol {
        context: FailureContext,
        reason: String,
    },

    #[error("invalid {role} transition {from} -> {to}")]
    InvalidTransition {
        role: NodeRole,
        from: &'static str,
        to: &'static str,
    },

    #[error("{} dimension(s) failed to reconstruct: {}", .failures.len(), describe_failures(.failures))]
    Reconstruction { failures: Vec<(usize, String)> },

    #[error("engine error: {0}")]
    Engine(#[from] ComputeError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_failures(failures: &[(usize, String)]) -> String {
    failures
        .iter()
        .map(|(column, reason)| format!("column {column}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<S2gError> for ClusterError {
    fn from(e: S2gError) -> Self {
        match e {
            S2gError::InvalidParameter(reason) => Self::InvalidParameter(reason),
            other => Self::Engine(ComputeError::Core(other)),
        }
    }
}

impl ClusterError {
    /// Node, state and peer of a coordination failure.
    pub fn context(&self) -> Option<&FailureContext> {
        match self {
            Self::TopologyMismatch { context, .. }
            | Self::Connection { context, .. }
            | Self::Uplink { context, .. }
            | Self::Timeout { context, .. }
            | Self::Cancelled { context }
            | Self::Protocol { context, .. } => Some(context),
            _ => None,
        }
    }
}

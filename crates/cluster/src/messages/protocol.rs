//! Payloads of the rendezvous frames.
//!
//! Each payload is carried in a [`Message`] under its topic. The
//! `into_message` / `from_message` pairs keep topic and payload type in
//! lockstep so a frame can never be decoded as the wrong kind.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use s2gpp_compute::{TimeSeries, WindowedScoreSeries};
use s2gpp_core::{ColumnBounds, ColumnRange, ModelParameters};

use crate::message::{Message, PROTOCOL_VERSION};

use super::topics;

/// A payload bound to exactly one topic.
pub trait Frame: Serialize + DeserializeOwned {
    const TOPIC: &'static str;

    fn into_message(&self, correlation_id: Uuid) -> Result<Message, rmp_serde::encode::Error> {
        Message::encode(Self::TOPIC, self, correlation_id)
    }

    /// Decode `msg`, or explain why it is not a frame of this kind.
    fn from_message(msg: &Message) -> Result<Self, FrameMismatch> {
        if !msg.is_current_version() {
            return Err(FrameMismatch(format!(
                "protocol version {} (expected {PROTOCOL_VERSION})",
                msg.version
            )));
        }
        if msg.topic != Self::TOPIC {
            return Err(FrameMismatch(format!(
                "unexpected topic '{}' (expected '{}')",
                msg.topic,
                Self::TOPIC
            )));
        }
        msg.decode()
            .map_err(|e| FrameMismatch(format!("malformed '{}' payload: {e}", msg.topic)))
    }
}

/// Why a received envelope was not the expected frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMismatch(pub String);

impl std::fmt::Display for FrameMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sub → Main, first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Address the sub advertises as its identity.
    pub advertised: SocketAddr,
    /// Coordinator address as the sub resolved it.
    pub coordinator: SocketAddr,
    /// Cluster size the sub was started with.
    pub n_cluster_nodes: usize,
    /// Columns the sub was told to analyze, unresolved.
    pub columns: ColumnBounds,
}

impl Frame for Hello {
    const TOPIC: &'static str = topics::HELLO;
}

/// Main → Sub, sent instead of an assignment when the sub does not fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub reason: String,
}

impl Frame for Reject {
    const TOPIC: &'static str = topics::REJECT;
}

/// Main → Sub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub run_id: Uuid,
    pub range: ColumnRange,
    pub params: ModelParameters,
    /// Exactly the columns of `range`, with global indices.
    pub series: TimeSeries,
}

impl Frame for Assignment {
    const TOPIC: &'static str = topics::ASSIGNMENT;
}

/// Sub → Main, one per assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub run_id: Uuid,
    pub range: ColumnRange,
    /// One series per column of `range`.
    pub series: Vec<WindowedScoreSeries>,
}

impl Frame for ScoreReport {
    const TOPIC: &'static str = topics::RESULT;
}

impl ScoreReport {
    /// Check that the report covers `range` with one series per column and
    /// nothing else.
    pub fn check_covers(&self, range: ColumnRange) -> Result<(), String> {
        if self.range != range {
            return Err(format!("report is for {} but {range} was assigned", self.range));
        }
        let mut columns: Vec<usize> = self.series.iter().map(|s| s.column).collect();
        columns.sort_unstable();
        if columns != range.columns().collect::<Vec<_>>() {
            return Err(format!(
                "report columns {columns:?} do not match the assigned range {range}"
            ));
        }
        Ok(())
    }
}

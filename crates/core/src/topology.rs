use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Result, S2gError};

/// Which side of the rendezvous protocol a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Main,
    Sub,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Main => write!(f, "main"),
            NodeRole::Sub => write!(f, "sub"),
        }
    }
}

/// Half-open range of series dimensions `[start, end)` a node analyzes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRange {
    pub start: usize,
    pub end: usize,
}

impl ColumnRange {
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if end < start {
            return Err(S2gError::InvalidParameter(format!(
                "column range end {end} is before start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, column: usize) -> bool {
        (self.start..self.end).contains(&column)
    }

    pub fn columns(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for ColumnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Column bounds as the user writes them, before the column count is known.
///
/// `end == 0` selects through the last column, a positive `end` is an
/// absolute exclusive end, and a negative `end` counts back from the last
/// column (`-1` drops the last column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnBounds {
    pub start: usize,
    pub end: isize,
}

impl ColumnBounds {
    pub fn new(start: usize, end: isize) -> Self {
        Self { start, end }
    }

    /// Every column of the series.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn resolve(&self, n_columns: usize) -> Result<ColumnRange> {
        let end = match self.end {
            0 => n_columns,
            e if e > 0 => e as usize,
            e => {
                let back = e.unsigned_abs();
                n_columns.checked_sub(back).ok_or_else(|| {
                    S2gError::InvalidParameter(format!(
                        "column end {e} reaches before the first of {n_columns} columns"
                    ))
                })?
            }
        };
        if end > n_columns {
            return Err(S2gError::InvalidParameter(format!(
                "column end {end} exceeds the {n_columns} available columns"
            )));
        }
        ColumnRange::new(self.start, end)
    }
}

/// Cluster membership as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Total nodes including the coordinator.
    pub n_cluster_nodes: usize,
    pub local_address: SocketAddr,
    /// Required on sub nodes, absent on the coordinator.
    pub coordinator_address: Option<SocketAddr>,
}

impl ClusterTopology {
    pub fn main(n_cluster_nodes: usize, local_address: SocketAddr) -> Self {
        Self {
            n_cluster_nodes,
            local_address,
            coordinator_address: None,
        }
    }

    pub fn sub(
        n_cluster_nodes: usize,
        local_address: SocketAddr,
        coordinator_address: SocketAddr,
    ) -> Self {
        Self {
            n_cluster_nodes,
            local_address,
            coordinator_address: Some(coordinator_address),
        }
    }

    /// Number of sub nodes the coordinator waits for.
    pub fn expected_subs(&self) -> usize {
        self.n_cluster_nodes.saturating_sub(1)
    }

    pub fn is_distributed(&self) -> bool {
        self.n_cluster_nodes > 1
    }

    /// Check that the topology is coherent for the given role.
    ///
    /// A zero node count is reported as a plain parameter problem, every
    /// other inconsistency as a mismatch.
    pub fn check_role(&self, role: NodeRole) -> std::result::Result<(), TopologyProblem> {
        if self.n_cluster_nodes == 0 {
            return Err(TopologyProblem::InvalidParameter(
                "n_cluster_nodes must be at least 1".into(),
            ));
        }
        match role {
            NodeRole::Main => match self.coordinator_address {
                Some(addr) if !same_endpoint(addr, self.local_address) => {
                    Err(TopologyProblem::Mismatch(format!(
                        "main node at {} names a different coordinator {addr}",
                        self.local_address
                    )))
                }
                _ => Ok(()),
            },
            NodeRole::Sub => {
                if !self.is_distributed() {
                    return Err(TopologyProblem::Mismatch(
                        "a sub node needs a cluster of at least 2 nodes".into(),
                    ));
                }
                match self.coordinator_address {
                    None => Err(TopologyProblem::Mismatch(
                        "sub node has no coordinator address".into(),
                    )),
                    Some(addr) if addr == self.local_address => Err(TopologyProblem::Mismatch(
                        format!("sub node advertises the coordinator address {addr} as its own"),
                    )),
                    Some(_) => Ok(()),
                }
            }
        }
    }
}

/// Why a topology was refused by [`ClusterTopology::check_role`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyProblem {
    InvalidParameter(String),
    Mismatch(String),
}

impl fmt::Display for TopologyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyProblem::InvalidParameter(s) | TopologyProblem::Mismatch(s) => f.write_str(s),
        }
    }
}

/// `true` when `seen` designates the endpoint bound at `bound`.
///
/// A coordinator bound to an unspecified address (`0.0.0.0`, `::`) is
/// reachable under any IP, so only the port is compared then.
pub fn same_endpoint(seen: SocketAddr, bound: SocketAddr) -> bool {
    if bound.ip().is_unspecified() {
        seen.port() == bound.port()
    } else {
        seen == bound
    }
}

/// Parse a `host:port` string, resolving host names through the system resolver.
pub fn parse_address(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    raw.to_socket_addrs()
        .map_err(|e| S2gError::InvalidParameter(format!("invalid address '{raw}': {e}")))?
        .next()
        .ok_or_else(|| S2gError::InvalidParameter(format!("address '{raw}' did not resolve")))
}

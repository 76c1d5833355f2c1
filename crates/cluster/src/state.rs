//! Node state machines.
//!
//! Both roles run a linear happy path with a single failure exit from every
//! non-terminal state. [`StateMachine`] enforces that shape, keeps the full
//! history for inspection and logs each step.

use std::fmt;
use std::net::SocketAddr;

use s2gpp_core::NodeRole;
use tracing::debug;

use crate::error::{ClusterError, FailureContext};

/// A state of one node role.
pub trait NodeState: Copy + Eq + fmt::Debug {
    const ROLE: NodeRole;
    const INITIAL: Self;
    const FAILED: Self;

    fn name(self) -> &'static str;

    fn is_terminal(self) -> bool;

    /// The next state on the happy path, `None` for terminal states.
    fn successor(self) -> Option<Self>;
}

// ── Main ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MainState {
    AwaitingWorkers,
    Dispatching,
    Collecting,
    Reconciling,
    Done,
    Failed,
}

impl NodeState for MainState {
    const ROLE: NodeRole = NodeRole::Main;
    const INITIAL: Self = Self::AwaitingWorkers;
    const FAILED: Self = Self::Failed;

    fn name(self) -> &'static str {
        match self {
            Self::AwaitingWorkers => "AwaitingWorkers",
            Self::Dispatching => "Dispatching",
            Self::Collecting => "Collecting",
            Self::Reconciling => "Reconciling",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn successor(self) -> Option<Self> {
        match self {
            Self::AwaitingWorkers => Some(Self::Dispatching),
            Self::Dispatching => Some(Self::Collecting),
            Self::Collecting => Some(Self::Reconciling),
            Self::Reconciling => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }
}

// ── Sub ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubState {
    Connecting,
    AwaitingAssignment,
    Computing,
    Reporting,
    Done,
    Failed,
}

impl NodeState for SubState {
    const ROLE: NodeRole = NodeRole::Sub;
    const INITIAL: Self = Self::Connecting;
    const FAILED: Self = Self::Failed;

    fn name(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::AwaitingAssignment => "AwaitingAssignment",
            Self::Computing => "Computing",
            Self::Reporting => "Reporting",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn successor(self) -> Option<Self> {
        match self {
            Self::Connecting => Some(Self::AwaitingAssignment),
            Self::AwaitingAssignment => Some(Self::Computing),
            Self::Computing => Some(Self::Reporting),
            Self::Reporting => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }
}

// ── Machine ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StateMachine<S: NodeState> {
    current: S,
    history: Vec<S>,
}

impl<S: NodeState> Default for StateMachine<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: NodeState> StateMachine<S> {
    pub fn new() -> Self {
        Self {
            current: S::INITIAL,
            history: vec![S::INITIAL],
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Every state entered so far, starting with the initial one.
    pub fn history(&self) -> &[S] {
        &self.history
    }

    /// Move to `next`, which must be the happy-path successor or `FAILED`.
    pub fn transition(&mut self, next: S) -> Result<(), ClusterError> {
        let allowed = if next == S::FAILED {
            !self.current.is_terminal()
        } else {
            self.current.successor() == Some(next)
        };
        if !allowed {
            return Err(ClusterError::InvalidTransition {
                role: S::ROLE,
                from: self.current.name(),
                to: next.name(),
            });
        }
        debug!(
            role = %S::ROLE,
            from = self.current.name(),
            to = next.name(),
            "state transition"
        );
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `FAILED` unless already terminal, returning `err` unchanged.
    pub fn fail(&mut self, err: ClusterError) -> ClusterError {
        if !self.current.is_terminal() {
            let _ = self.transition(S::FAILED);
        }
        err
    }

    /// Failure context for the current state.
    pub fn context(&self, peer: Option<SocketAddr>) -> FailureContext {
        let ctx = FailureContext::new(S::ROLE, self.current.name());
        match peer {
            Some(peer) => ctx.with_peer(peer),
            None => ctx,
        }
    }
}

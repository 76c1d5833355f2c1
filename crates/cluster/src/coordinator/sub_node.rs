use std::net::SocketAddr;
use std::sync::Arc;

use s2gpp_compute::{AnomalyEngine, ComputeError};
use s2gpp_core::{ClusterTopology, ColumnBounds, ColumnRange, NodeRole, TopologyProblem};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::{Bounded, Cancellation};
use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::messages::{topics, Assignment, Frame, Hello, Reject, ScoreReport};
use crate::state::{StateMachine, SubState};
use crate::transport::{connect_with_retry, Connection};

/// Worker side of a distributed run.
pub struct SubWorker {
    topology: ClusterTopology,
    coordinator: SocketAddr,
    config: ClusterConfig,
    cancel: Cancellation,
    machine: StateMachine<SubState>,
}

impl SubWorker {
    /// Validate the topology for the sub role. No network activity happens
    /// until [`run`](Self::run).
    pub fn new(topology: ClusterTopology, config: ClusterConfig) -> Result<Self, ClusterError> {
        let machine = StateMachine::<SubState>::new();
        let mismatch = |reason: String| ClusterError::TopologyMismatch {
            context: machine.context(None),
            reason,
        };
        topology.check_role(NodeRole::Sub).map_err(|p| match p {
            TopologyProblem::InvalidParameter(reason) => ClusterError::InvalidParameter(reason),
            TopologyProblem::Mismatch(reason) => mismatch(reason),
        })?;
        let coordinator = topology
            .coordinator_address
            .ok_or_else(|| mismatch("sub node has no coordinator address".into()))?;
        Ok(Self {
            topology,
            coordinator,
            config,
            cancel: Cancellation::new(),
            machine,
        })
    }

    /// Share a cancellation handle with the caller.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SubState {
        self.machine.current()
    }

    pub fn history(&self) -> &[SubState] {
        self.machine.history()
    }

    /// Run the protocol to completion and return the column range this node
    /// scored. Any failure leaves the machine in `Failed`.
    #[instrument(skip_all, fields(local = %self.topology.local_address, coordinator = %self.coordinator))]
    pub async fn run(
        &mut self,
        engine: Arc<dyn AnomalyEngine>,
        columns: ColumnBounds,
    ) -> Result<ColumnRange, ClusterError> {
        match self.drive(engine, columns).await {
            Ok(range) => Ok(range),
            Err(e) => {
                warn!(state = ?self.machine.current(), error = %e, "run failed");
                Err(self.machine.fail(e))
            }
        }
    }

    async fn drive(
        &mut self,
        engine: Arc<dyn AnomalyEngine>,
        columns: ColumnBounds,
    ) -> Result<ColumnRange, ClusterError> {
        // ── Connecting ──
        let mut conn = self.connect(columns).await?;
        self.machine.transition(SubState::AwaitingAssignment)?;

        // ── AwaitingAssignment ──
        let (run_id, assignment) = self.await_assignment(&mut conn).await?;
        let range = assignment.range;
        info!(%run_id, %range, rows = assignment.series.n_rows(), "assignment received");
        self.machine.transition(SubState::Computing)?;

        // ── Computing ──
        let task = {
            let engine = engine.clone();
            let Assignment { params, series, .. } = assignment;
            tokio::task::spawn_blocking(move || engine.score_windows(&params, &series))
        };
        let series = match self.cancel.until_cancelled(task).await {
            Some(joined) => joined.map_err(|e| ComputeError::Engine {
                engine: engine.name().to_string(),
                reason: format!("scoring task failed: {e}"),
            })??,
            None => return Err(self.cancelled()),
        };
        self.machine.transition(SubState::Reporting)?;

        // ── Reporting ──
        let report = ScoreReport {
            run_id,
            range,
            series,
        };
        let msg = report.into_message(run_id)?;
        match self
            .cancel
            .bounded(self.config.report_timeout(), conn.send(&msg))
            .await
        {
            Bounded::Ready(Ok(())) => {}
            Bounded::Ready(Err(e)) => {
                return Err(ClusterError::Uplink {
                    context: self.machine.context(Some(self.coordinator)),
                    reason: e.to_string(),
                })
            }
            Bounded::TimedOut => {
                return Err(ClusterError::Timeout {
                    context: self.machine.context(Some(self.coordinator)),
                    waited: self.config.report_timeout(),
                })
            }
            Bounded::Cancelled => return Err(self.cancelled()),
        }
        conn.close().await;
        self.machine.transition(SubState::Done)?;
        info!(%run_id, %range, "scores reported");
        Ok(range)
    }

    async fn connect(&self, columns: ColumnBounds) -> Result<Connection, ClusterError> {
        let attempts = self.config.connect_attempts;
        let dial = connect_with_retry(
            self.coordinator,
            attempts,
            self.config.connect_backoff(),
            self.config.connect_timeout(),
        );
        let mut conn = match self.cancel.until_cancelled(dial).await {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => {
                return Err(ClusterError::Connection {
                    context: self.machine.context(Some(self.coordinator)),
                    reason: format!("gave up after {attempts} attempt(s): {e}"),
                })
            }
            None => return Err(self.cancelled()),
        };

        let hello = Hello {
            advertised: self.topology.local_address,
            coordinator: self.coordinator,
            n_cluster_nodes: self.topology.n_cluster_nodes,
            columns,
        };
        let msg = hello.into_message(Uuid::new_v4())?;
        match self.cancel.until_cancelled(conn.send(&msg)).await {
            Some(Ok(())) => {
                debug!(coordinator = %self.coordinator, "hello sent");
                Ok(conn)
            }
            Some(Err(e)) => Err(ClusterError::Connection {
                context: self.machine.context(Some(self.coordinator)),
                reason: format!("sending hello failed: {e}"),
            }),
            None => Err(self.cancelled()),
        }
    }

    async fn await_assignment(
        &self,
        conn: &mut Connection,
    ) -> Result<(Uuid, Assignment), ClusterError> {
        let protocol = |reason: String| ClusterError::Protocol {
            context: self.machine.context(Some(self.coordinator)),
            reason,
        };
        let msg = match self
            .cancel
            .bounded(self.config.assignment_timeout(), conn.recv())
            .await
        {
            Bounded::Ready(Ok(msg)) => msg,
            Bounded::Ready(Err(e)) => return Err(protocol(format!("no assignment: {e}"))),
            Bounded::TimedOut => {
                return Err(ClusterError::Timeout {
                    context: self.machine.context(Some(self.coordinator)),
                    waited: self.config.assignment_timeout(),
                })
            }
            Bounded::Cancelled => return Err(self.cancelled()),
        };

        if msg.topic == topics::REJECT {
            let reason = Reject::from_message(&msg)
                .map(|r| r.reason)
                .unwrap_or_else(|e| format!("unreadable reject: {e}"));
            return Err(ClusterError::TopologyMismatch {
                context: self.machine.context(Some(self.coordinator)),
                reason: format!("coordinator rejected this node: {reason}"),
            });
        }
        let assignment = Assignment::from_message(&msg).map_err(|e| protocol(e.to_string()))?;
        if assignment.run_id != msg.correlation_id {
            return Err(protocol(format!(
                "assignment names run {} but arrived as {}",
                assignment.run_id, msg.correlation_id
            )));
        }
        if assignment.series.column_range() != assignment.range {
            return Err(protocol(format!(
                "assignment for {} carries columns {}",
                assignment.range,
                assignment.series.column_range()
            )));
        }
        Ok((msg.correlation_id, assignment))
    }

    fn cancelled(&self) -> ClusterError {
        ClusterError::Cancelled {
            context: self.machine.context(Some(self.coordinator)),
        }
    }
}

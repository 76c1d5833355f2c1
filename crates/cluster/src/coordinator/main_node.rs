use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use s2gpp_compute::{AnomalyEngine, ComputeError, ReconstructedScoreSeries, TimeSeries, WindowedScoreSeries};
use s2gpp_core::{same_endpoint, ClusterTopology, ColumnRange, ModelParameters, NodeRole, TopologyProblem};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::{Bounded, Cancellation};
use crate::config::{ClusterConfig, MAX_TIMEOUT_SECS};
use crate::error::ClusterError;
use crate::messages::{Assignment, Frame, Hello, Reject, ScoreReport};
use crate::state::{MainState, NodeState, StateMachine};
use crate::transport::Connection;

use super::reconstruct_strict;

/// A sub node that passed the handshake.
struct Registered {
    conn: Connection,
    hello: Hello,
}

/// A sub node that holds an assignment.
struct Assigned {
    conn: Connection,
    advertised: SocketAddr,
    range: ColumnRange,
}

enum Arrival {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Handshaken(Result<Option<(Connection, Hello)>, JoinError>),
}

/// Read one hello from a fresh connection. `None` drops the connection.
async fn handshake(stream: TcpStream, peer: SocketAddr, limit: Duration) -> Option<(Connection, Hello)> {
    let mut conn = match Connection::new(stream) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%peer, error = %e, "dropping connection");
            return None;
        }
    };
    match tokio::time::timeout(limit, conn.recv()).await {
        Ok(Ok(msg)) => match Hello::from_message(&msg) {
            Ok(hello) => Some((conn, hello)),
            Err(reason) => {
                warn!(%peer, %reason, "dropping connection without a valid hello");
                None
            }
        },
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "handshake failed");
            None
        }
        Err(_) => {
            warn!(%peer, "no hello within the handshake timeout");
            None
        }
    }
}

/// Coordinator side of a distributed run.
///
/// Binding happens in [`bind`](Self::bind) so callers can learn the actual
/// listening address before any sub dials in.
pub struct MainCoordinator {
    listener: Option<TcpListener>,
    bound: SocketAddr,
    topology: ClusterTopology,
    config: ClusterConfig,
    cancel: Cancellation,
    machine: StateMachine<MainState>,
}

impl MainCoordinator {
    /// Validate the topology for the main role and bind its address.
    pub async fn bind(topology: ClusterTopology, config: ClusterConfig) -> Result<Self, ClusterError> {
        let machine = StateMachine::<MainState>::new();
        topology.check_role(NodeRole::Main).map_err(|p| match p {
            TopologyProblem::InvalidParameter(reason) => ClusterError::InvalidParameter(reason),
            TopologyProblem::Mismatch(reason) => ClusterError::TopologyMismatch {
                context: machine.context(None),
                reason,
            },
        })?;
        let listener = TcpListener::bind(topology.local_address)
            .await
            .map_err(|e| ClusterError::Connection {
                context: machine.context(None),
                reason: format!("cannot bind {}: {e}", topology.local_address),
            })?;
        let bound = listener.local_addr()?;
        info!(%bound, nodes = topology.n_cluster_nodes, "coordinator listening");
        Ok(Self {
            listener: Some(listener),
            bound,
            topology,
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

    /// Address actually bound (differs from the topology when it asked for port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }

    pub fn state(&self) -> MainState {
        self.machine.current()
    }

    pub fn history(&self) -> &[MainState] {
        self.machine.history()
    }

    /// Run the protocol to completion.
    ///
    /// `own` is this node's resolved column range within `series`. Returns
    /// the reconstructed scores of every assigned column in ascending column
    /// order. Any failure leaves the machine in `Failed`.
    #[instrument(skip_all, fields(bind = %self.bound, nodes = self.topology.n_cluster_nodes))]
    pub async fn run(
        &mut self,
        engine: Arc<dyn AnomalyEngine>,
        params: &ModelParameters,
        series: Arc<TimeSeries>,
        own: ColumnRange,
    ) -> Result<Vec<ReconstructedScoreSeries>, ClusterError> {
        match self.drive(engine, params, series, own).await {
            Ok(scores) => Ok(scores),
            Err(e) => {
                warn!(state = ?self.machine.current(), error = %e, "run failed");
                Err(self.machine.fail(e))
            }
        }
    }

    async fn drive(
        &mut self,
        engine: Arc<dyn AnomalyEngine>,
        params: &ModelParameters,
        series: Arc<TimeSeries>,
        own: ColumnRange,
    ) -> Result<Vec<ReconstructedScoreSeries>, ClusterError> {
        if self.machine.current() != MainState::AwaitingWorkers {
            return Err(ClusterError::InvalidTransition {
                role: NodeRole::Main,
                from: self.machine.current().name(),
                to: "AwaitingWorkers",
            });
        }
        let listener = self.listener.take().ok_or_else(|| ClusterError::Protocol {
            context: self.machine.context(None),
            reason: "listener already consumed".into(),
        })?;

        // ── AwaitingWorkers ──
        let registered = self.await_workers(&listener).await?;
        let _rejector = spawn_rejector(
            listener,
            self.topology.n_cluster_nodes,
            self.config.handshake_timeout(),
        );
        self.machine.transition(MainState::Dispatching)?;

        // ── Dispatching ──
        let run_id = Uuid::new_v4();
        let assigned = self.dispatch(registered, params, &series, run_id).await?;
        let own_slice = series.select(own)?;
        let local = {
            let engine = engine.clone();
            let params = params.clone();
            tokio::task::spawn_blocking(move || engine.score_windows(&params, &own_slice))
        };
        info!(%run_id, own = %own, subs = assigned.len(), "work dispatched");
        self.machine.transition(MainState::Collecting)?;

        // ── Collecting ──
        let mut ranges: Vec<ColumnRange> = assigned.iter().map(|a| a.range).collect();
        ranges.push(own);
        let (reports, own_scores) = self.collect(assigned, local, engine.name(), run_id).await?;
        self.machine.transition(MainState::Reconciling)?;

        // ── Reconciling ──
        let merged = self.reconcile(&ranges, own_scores, reports)?;
        let scores = reconstruct_strict(&merged, self.config.reduction)?;
        self.machine.transition(MainState::Done)?;
        info!(%run_id, columns = scores.len(), "run complete");
        Ok(scores)
    }

    async fn await_workers(&self, listener: &TcpListener) -> Result<Vec<Registered>, ClusterError> {
        let expected = self.topology.expected_subs();
        let started = Instant::now();
        let deadline = started
            .checked_add(self.config.accept_timeout())
            .unwrap_or_else(|| started + Duration::from_secs(MAX_TIMEOUT_SECS));
        let mut registered: Vec<Registered> = Vec::with_capacity(expected);
        // Each connection shakes hands in its own task so a silent peer
        // cannot hold up the ones behind it.
        let mut handshakes = JoinSet::new();

        while registered.len() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = async {
                tokio::select! {
                    accepted = listener.accept() => Arrival::Accepted(accepted),
                    Some(done) = handshakes.join_next(), if !handshakes.is_empty() => Arrival::Handshaken(done),
                }
            };
            let arrival = match self.cancel.bounded(remaining, next).await {
                Bounded::Ready(arrival) => arrival,
                Bounded::TimedOut => {
                    return Err(ClusterError::Timeout {
                        context: self.machine.context(None),
                        waited: self.config.accept_timeout(),
                    })
                }
                Bounded::Cancelled => return Err(self.cancelled(None)),
            };

            let (conn, hello) = match arrival {
                Arrival::Accepted(Ok((stream, peer))) => {
                    handshakes.spawn(handshake(stream, peer, self.config.handshake_timeout()));
                    continue;
                }
                Arrival::Accepted(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
                Arrival::Handshaken(Ok(Some(shaken))) => shaken,
                Arrival::Handshaken(Ok(None)) => continue,
                Arrival::Handshaken(Err(e)) => {
                    warn!(error = %e, "handshake task failed");
                    continue;
                }
            };

            let peer = conn.peer();
            if let Err(reason) = self.check_hello(&hello, &registered) {
                warn!(%peer, advertised = %hello.advertised, %reason, "rejecting sub node");
                reject(conn, reason).await;
                continue;
            }
            info!(
                %peer,
                advertised = %hello.advertised,
                registered = registered.len() + 1,
                expected,
                "sub node registered"
            );
            registered.push(Registered { conn, hello });
        }
        Ok(registered)
    }

    /// Why `hello` cannot join this cluster, if it cannot.
    fn check_hello(&self, hello: &Hello, registered: &[Registered]) -> Result<(), String> {
        if hello.n_cluster_nodes != self.topology.n_cluster_nodes {
            return Err(format!(
                "sub expects {} cluster nodes, coordinator runs {}",
                hello.n_cluster_nodes, self.topology.n_cluster_nodes
            ));
        }
        if hello.advertised == self.bound || hello.advertised == self.topology.local_address {
            return Err(format!(
                "sub advertises the coordinator's own address {}",
                hello.advertised
            ));
        }
        if registered.iter().any(|r| r.hello.advertised == hello.advertised) {
            return Err(format!(
                "a sub advertising {} is already registered",
                hello.advertised
            ));
        }
        if !same_endpoint(hello.coordinator, self.bound) {
            return Err(format!(
                "sub addressed coordinator {} but this coordinator is bound to {}",
                hello.coordinator, self.bound
            ));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        registered: Vec<Registered>,
        params: &ModelParameters,
        series: &TimeSeries,
        run_id: Uuid,
    ) -> Result<Vec<Assigned>, ClusterError> {
        let mut assigned = Vec::with_capacity(registered.len());
        for Registered { mut conn, hello } in registered {
            let peer = conn.peer();
            let range = hello.columns.resolve(series.n_columns()).map_err(|e| {
                ClusterError::InvalidParameter(format!("sub {}: {e}", hello.advertised))
            })?;
            let assignment = Assignment {
                run_id,
                range,
                params: params.clone(),
                series: series.select(range)?,
            };
            let msg = assignment.into_message(run_id)?;
            match self
                .cancel
                .bounded(self.config.dispatch_timeout(), conn.send(&msg))
                .await
            {
                Bounded::Ready(Ok(())) => {}
                Bounded::Ready(Err(e)) => {
                    return Err(ClusterError::Connection {
                        context: self.machine.context(Some(peer)),
                        reason: format!("sending assignment failed: {e}"),
                    })
                }
                Bounded::TimedOut => {
                    warn!(%peer, advertised = %hello.advertised, "sub is not taking its assignment");
                    return Err(ClusterError::Timeout {
                        context: self.machine.context(Some(peer)),
                        waited: self.config.dispatch_timeout(),
                    });
                }
                Bounded::Cancelled => return Err(self.cancelled(Some(peer))),
            }
            debug!(%peer, advertised = %hello.advertised, %range, "assignment sent");
            assigned.push(Assigned {
                conn,
                advertised: hello.advertised,
                range,
            });
        }
        Ok(assigned)
    }

    async fn collect(
        &self,
        assigned: Vec<Assigned>,
        local: JoinHandle<Result<Vec<WindowedScoreSeries>, ComputeError>>,
        engine_name: &str,
        run_id: Uuid,
    ) -> Result<(Vec<ScoreReport>, Vec<WindowedScoreSeries>), ClusterError> {
        let expected = assigned.len();
        let mut receivers = JoinSet::new();
        for a in assigned {
            receivers.spawn(receive_report(a, run_id));
        }

        let subs = async {
            let mut reports = Vec::with_capacity(expected);
            while let Some(joined) = receivers.join_next().await {
                match joined {
                    Ok((advertised, Ok(report))) => {
                        info!(%advertised, range = %report.range, "scores received");
                        reports.push(report);
                    }
                    Ok((advertised, Err(reason))) => {
                        return Err(ClusterError::Protocol {
                            context: self.machine.context(Some(advertised)),
                            reason,
                        })
                    }
                    Err(e) => {
                        return Err(ClusterError::Protocol {
                            context: self.machine.context(None),
                            reason: format!("receiver task failed: {e}"),
                        })
                    }
                }
            }
            Ok::<_, ClusterError>(reports)
        };
        let own = async {
            let scores = local.await.map_err(|e| ComputeError::Engine {
                engine: engine_name.to_string(),
                reason: format!("local scoring task failed: {e}"),
            })??;
            Ok::<_, ClusterError>(scores)
        };

        match self
            .cancel
            .bounded(self.config.collect_timeout(), async { tokio::try_join!(subs, own) })
            .await
        {
            Bounded::Ready(result) => result,
            Bounded::TimedOut => Err(ClusterError::Timeout {
                context: self.machine.context(None),
                waited: self.config.collect_timeout(),
            }),
            Bounded::Cancelled => Err(self.cancelled(None)),
        }
    }

    /// Merge every node's series in ascending column order.
    fn reconcile(
        &self,
        ranges: &[ColumnRange],
        own: Vec<WindowedScoreSeries>,
        reports: Vec<ScoreReport>,
    ) -> Result<Vec<WindowedScoreSeries>, ClusterError> {
        let mut merged = BTreeMap::new();
        for series in own.into_iter().chain(reports.into_iter().flat_map(|r| r.series)) {
            let column = series.column;
            if merged.insert(column, series).is_some() {
                return Err(ClusterError::Protocol {
                    context: self.machine.context(None),
                    reason: format!("column {column} was scored more than once; column ranges overlap"),
                });
            }
        }
        if let Some(missing) = ranges
            .iter()
            .flat_map(|r| r.columns())
            .find(|c| !merged.contains_key(c))
        {
            return Err(ClusterError::Protocol {
                context: self.machine.context(None),
                reason: format!("no scores for assigned column {missing}"),
            });
        }
        Ok(merged.into_values().collect())
    }

    fn cancelled(&self, peer: Option<SocketAddr>) -> ClusterError {
        ClusterError::Cancelled {
            context: self.machine.context(peer),
        }
    }
}

/// Wait for one sub's report and check it against its assignment.
async fn receive_report(a: Assigned, run_id: Uuid) -> (SocketAddr, Result<ScoreReport, String>) {
    let Assigned {
        mut conn,
        advertised,
        range,
    } = a;
    let outcome = async {
        let msg = conn
            .recv()
            .await
            .map_err(|e| format!("no results from sub: {e}"))?;
        if msg.correlation_id != run_id {
            return Err(format!("result belongs to run {}, not {run_id}", msg.correlation_id));
        }
        let report = ScoreReport::from_message(&msg).map_err(|e| e.to_string())?;
        if report.run_id != run_id {
            return Err(format!("report names run {}, not {run_id}", report.run_id));
        }
        report.check_covers(range)?;
        Ok::<_, String>(report)
    }
    .await;
    conn.close().await;
    (advertised, outcome)
}

async fn reject(mut conn: Connection, reason: String) {
    match (Reject { reason }).into_message(Uuid::new_v4()) {
        Ok(msg) => {
            if let Err(e) = conn.send(&msg).await {
                debug!(peer = %conn.peer(), error = %e, "reject not delivered");
            }
        }
        Err(e) => warn!(error = %e, "cannot encode reject"),
    }
    conn.close().await;
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Reject every connection that arrives after the cluster is complete.
fn spawn_rejector(listener: TcpListener, n_cluster_nodes: usize, handshake: Duration) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        // Owned here so aborting the rejector aborts pending rejections too.
        let mut pending = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        pending.spawn(reject_late(stream, peer, n_cluster_nodes, handshake));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = pending.join_next(), if !pending.is_empty() => {}
            }
        }
    }))
}

async fn reject_late(stream: TcpStream, peer: SocketAddr, n_cluster_nodes: usize, handshake: Duration) {
    let Ok(mut conn) = Connection::new(stream) else {
        return;
    };
    // Read the hello first so the reject is not lost to a reset.
    let _ = tokio::time::timeout(handshake, conn.recv()).await;
    warn!(%peer, "rejecting connection, cluster is complete");
    reject(
        conn,
        format!("cluster already has all {n_cluster_nodes} nodes registered"),
    )
    .await;
}

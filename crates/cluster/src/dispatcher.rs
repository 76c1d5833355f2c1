//! Chooses how a run executes and drives it to an outcome.

use std::path::PathBuf;
use std::sync::Arc;

use s2gpp_compute::{series::write_scores, AnomalyEngine, ReconstructedScoreSeries, TimeSeries};
use s2gpp_core::{ClusterTopology, ColumnBounds, ColumnRange, ModelParameters, NodeRole, TopologyProblem};
use tracing::{info, instrument};

use crate::cancel::Cancellation;
use crate::config::ClusterConfig;
use crate::coordinator::{reconstruct_strict, MainCoordinator, SubWorker};
use crate::error::{ClusterError, FailureContext};

/// The four ways a run can be executed.
#[derive(Debug, Clone)]
pub enum ExecutionPlan {
    /// Score an in-memory series in this process.
    LocalArray { series: TimeSeries },
    /// Read a delimited file and score it in this process.
    LocalFile { data_path: PathBuf },
    /// Coordinate a cluster (or run alone when it has one node) and write
    /// the merged scores to `output_path`.
    DistributedMain {
        data_path: PathBuf,
        output_path: PathBuf,
        columns: ColumnBounds,
        topology: ClusterTopology,
    },
    /// Serve one coordinator as a sub node.
    DistributedSub {
        columns: ColumnBounds,
        topology: ClusterTopology,
    },
}

impl ExecutionPlan {
    pub fn role(&self) -> Option<NodeRole> {
        match self {
            Self::LocalArray { .. } | Self::LocalFile { .. } => None,
            Self::DistributedMain { .. } => Some(NodeRole::Main),
            Self::DistributedSub { .. } => Some(NodeRole::Sub),
        }
    }
}

/// What a run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Per-timestamp scores, one series per dimension in column order.
    Scores(Vec<ReconstructedScoreSeries>),
    /// Scores written to `path`.
    Written {
        path: PathBuf,
        n_timestamps: usize,
        n_columns: usize,
    },
    /// A sub node delivered the scores of `columns` to its coordinator.
    Reported { columns: ColumnRange },
}

/// Runs execution plans against one engine.
pub struct Dispatcher {
    engine: Arc<dyn AnomalyEngine>,
    config: ClusterConfig,
    cancel: Cancellation,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn AnomalyEngine>, config: ClusterConfig) -> Self {
        Self {
            engine,
            config,
            cancel: Cancellation::new(),
        }
    }

    /// Share a cancellation handle with the caller.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    #[instrument(skip_all, fields(engine = self.engine.name(), role = ?plan.role()))]
    pub async fn execute(
        &self,
        params: &ModelParameters,
        plan: ExecutionPlan,
    ) -> Result<RunOutcome, ClusterError> {
        if let Some(role) = plan.role() {
            check_plan_topology(&plan, role)?;
        }
        let mode = self.config.reduction;
        match plan {
            ExecutionPlan::LocalArray { series } => {
                let engine = self.engine.clone();
                let params = params.clone();
                let scores = tokio::task::spawn_blocking(move || {
                    engine.local_array(&params, &series, mode)
                })
                .await
                .map_err(|e| self.join_failure(e))??;
                Ok(RunOutcome::Scores(scores))
            }
            ExecutionPlan::LocalFile { data_path } => {
                let engine = self.engine.clone();
                let params = params.clone();
                let scores = tokio::task::spawn_blocking(move || {
                    engine.local_file(&params, &data_path, mode)
                })
                .await
                .map_err(|e| self.join_failure(e))??;
                Ok(RunOutcome::Scores(scores))
            }
            ExecutionPlan::DistributedMain {
                data_path,
                output_path,
                columns,
                topology,
            } => {
                let series = Arc::new(TimeSeries::read_delimited(&data_path)?);
                let own = columns.resolve(series.n_columns())?;
                let scores = if topology.is_distributed() {
                    let mut main = MainCoordinator::bind(topology, self.config.clone())
                        .await?
                        .with_cancellation(self.cancel.clone());
                    main.run(self.engine.clone(), params, series, own).await?
                } else {
                    info!(columns = %own, "single-node cluster, scoring locally");
                    self.score_locally(params, series, own).await?
                };
                self.write(output_path, scores)
            }
            ExecutionPlan::DistributedSub { columns, topology } => {
                let mut sub = SubWorker::new(topology, self.config.clone())?
                    .with_cancellation(self.cancel.clone());
                let columns = sub.run(self.engine.clone(), columns).await?;
                Ok(RunOutcome::Reported { columns })
            }
        }
    }

    async fn score_locally(
        &self,
        params: &ModelParameters,
        series: Arc<TimeSeries>,
        own: ColumnRange,
    ) -> Result<Vec<ReconstructedScoreSeries>, ClusterError> {
        let slice = series.select(own)?;
        let engine = self.engine.clone();
        let params = params.clone();
        let task = tokio::task::spawn_blocking(move || engine.score_windows(&params, &slice));
        let windowed = match self.cancel.until_cancelled(task).await {
            Some(joined) => joined.map_err(|e| self.join_failure(e))??,
            None => {
                return Err(ClusterError::Cancelled {
                    context: FailureContext::new(NodeRole::Main, "AwaitingWorkers"),
                })
            }
        };
        reconstruct_strict(&windowed, self.config.reduction)
    }

    fn write(
        &self,
        path: PathBuf,
        scores: Vec<ReconstructedScoreSeries>,
    ) -> Result<RunOutcome, ClusterError> {
        write_scores(&path, &scores)?;
        let n_timestamps = scores.first().map(ReconstructedScoreSeries::len).unwrap_or(0);
        info!(
            path = %path.display(),
            n_timestamps,
            n_columns = scores.len(),
            "anomaly scores written"
        );
        Ok(RunOutcome::Written {
            path,
            n_timestamps,
            n_columns: scores.len(),
        })
    }

    fn join_failure(&self, e: tokio::task::JoinError) -> s2gpp_compute::ComputeError {
        s2gpp_compute::ComputeError::Engine {
            engine: self.engine.name().to_string(),
            reason: format!("scoring task failed: {e}"),
        }
    }
}

/// Check the plan's topology before anything touches the network.
fn check_plan_topology(plan: &ExecutionPlan, role: NodeRole) -> Result<(), ClusterError> {
    let (topology, initial_state) = match plan {
        ExecutionPlan::DistributedMain { topology, .. } => (topology, "AwaitingWorkers"),
        ExecutionPlan::DistributedSub { topology, .. } => (topology, "Connecting"),
        _ => return Ok(()),
    };
    topology.check_role(role).map_err(|p| match p {
        TopologyProblem::InvalidParameter(reason) => ClusterError::InvalidParameter(reason),
        TopologyProblem::Mismatch(reason) => ClusterError::TopologyMismatch {
            context: FailureContext::new(role, initial_state),
            reason,
        },
    })
}

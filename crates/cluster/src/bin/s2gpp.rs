//! s2gpp: run anomaly scoring locally or across a cluster of nodes.
//!
//! # Usage
//!
//! ```bash
//! # Score a file in this process and print the scores
//! s2gpp local --data-path series.csv --pattern-length 50
//!
//! # Coordinate a three-node cluster and write the merged scores
//! s2gpp main --data-path series.csv --output-path scores.ts --cluster-nodes 3 \
//!     --local-host 0.0.0.0:1992 --column-start-idx 0 --column-end-idx 1
//!
//! # Join it as a sub node
//! s2gpp sub --mainhost 10.0.0.1:1992 --cluster-nodes 3 --local-host 10.0.0.2:1993 \
//!     --column-start-idx 1 --column-end-idx 2
//! ```
//!
//! Every flag falls back to its `S2GPP_*` environment variable (a `.env`
//! file is honoured); cluster timing is read from `s2gpp.toml`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use s2gpp_cluster::{Cancellation, ClusterConfig, Dispatcher, ExecutionPlan, RunOutcome};
use s2gpp_compute::series::{write_score_rows, write_scores};
use s2gpp_compute::{AnomalyEngine, DiscordEngine, ReconstructedScoreSeries};
use s2gpp_core::config::load_dotenv;
use s2gpp_core::{parse_address, ClusterTopology, ClusteringMethod, Config};

/// Series2Graph++ anomaly scoring, single-node or distributed.
#[derive(Parser, Debug)]
#[command(name = "s2gpp", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score a series file in this process.
    Local {
        /// Delimited input series.
        #[arg(long)]
        data_path: PathBuf,

        /// Write scores here instead of printing them.
        #[arg(long)]
        output_path: Option<PathBuf>,

        #[command(flatten)]
        shared: SharedArgs,
    },
    /// Coordinate a distributed run and write the merged scores.
    Main {
        #[arg(long)]
        data_path: PathBuf,

        #[arg(long)]
        output_path: Option<PathBuf>,

        /// Total nodes including this one.
        #[arg(long)]
        cluster_nodes: Option<usize>,

        #[command(flatten)]
        shared: SharedArgs,
    },
    /// Join a coordinator as a sub node.
    Sub {
        /// Coordinator `host:port`.
        #[arg(long)]
        mainhost: Option<String>,

        #[arg(long)]
        cluster_nodes: Option<usize>,

        #[command(flatten)]
        shared: SharedArgs,
    },
}

/// Flags shared by every subcommand. Unset flags keep the environment value.
#[derive(Args, Debug)]
struct SharedArgs {
    #[arg(long)]
    pattern_length: Option<i64>,

    /// Latent dimensionality (default: pattern length / 3).
    #[arg(long)]
    latent: Option<i64>,

    #[arg(long)]
    rate: Option<i64>,

    /// Scoring window length (default: pattern length).
    #[arg(long)]
    query_length: Option<i64>,

    /// Engine threads (<= 0 selects the default).
    #[arg(long, allow_negative_numbers = true)]
    threads: Option<i64>,

    /// "kde" or "meanshift".
    #[arg(long)]
    clustering: Option<ClusteringMethod>,

    #[arg(long)]
    self_correction: bool,

    /// `host:port` this node binds (main) or advertises (sub).
    #[arg(long)]
    local_host: Option<String>,

    #[arg(long)]
    column_start_idx: Option<usize>,

    /// Exclusive end column; 0 = last column, negative counts from the end.
    #[arg(long, allow_negative_numbers = true)]
    column_end_idx: Option<isize>,

    /// Cluster timing config file (default: ./s2gpp.toml when present).
    #[arg(long, env = "S2GPP_CONFIG")]
    config: Option<PathBuf>,
}

impl SharedArgs {
    fn apply(&self, config: &mut Config) {
        let model = &mut config.model;
        if let Some(v) = self.pattern_length {
            model.pattern_length = v;
        }
        if self.latent.is_some() {
            model.latent = self.latent;
        }
        if let Some(v) = self.rate {
            model.rate = v;
        }
        if self.query_length.is_some() {
            model.query_length = self.query_length;
        }
        if let Some(v) = self.threads {
            model.n_threads = v;
        }
        if let Some(v) = self.clustering {
            model.clustering = v;
        }
        model.self_correction |= self.self_correction;

        let node = &mut config.node;
        if let Some(v) = &self.local_host {
            node.local_host = v.clone();
        }
        if let Some(v) = self.column_start_idx {
            node.columns.start = v;
        }
        if let Some(v) = self.column_end_idx {
            node.columns.end = v;
        }
    }
}

impl Command {
    fn shared(&self) -> &SharedArgs {
        match self {
            Self::Local { shared, .. } | Self::Main { shared, .. } | Self::Sub { shared, .. } => {
                shared
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    cli.command.shared().apply(&mut config);
    match &cli.command {
        Command::Main {
            output_path,
            cluster_nodes,
            ..
        } => {
            if let Some(path) = output_path {
                config.node.output_path = path.clone();
            }
            if let Some(n) = cluster_nodes {
                config.node.n_cluster_nodes = *n;
            }
        }
        Command::Sub {
            mainhost,
            cluster_nodes,
            ..
        } => {
            if mainhost.is_some() {
                config.node.mainhost = mainhost.clone();
            }
            if let Some(n) = cluster_nodes {
                config.node.n_cluster_nodes = *n;
            }
        }
        Command::Local { .. } => {}
    }
    config.log_summary();
    tracing::debug!(summary = %config.summary(), "effective configuration");

    let params = config.model.resolve().context("invalid model parameters")?;
    let cluster_config = ClusterConfig::load(cli.command.shared().config.as_deref())
        .context("invalid cluster config")?;

    let engine: Arc<dyn AnomalyEngine> = Arc::new(DiscordEngine::new());
    let cancel = Cancellation::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, cancelling run");
            cancel.cancel();
        });
    }
    let dispatcher = Dispatcher::new(engine, cluster_config).with_cancellation(cancel);

    let (plan, local_output) = match cli.command {
        Command::Local {
            data_path,
            output_path,
            ..
        } => (ExecutionPlan::LocalFile { data_path }, output_path),
        Command::Main { data_path, .. } => {
            let local_address = parse_address(&config.node.local_host)?;
            let plan = ExecutionPlan::DistributedMain {
                data_path,
                output_path: config.node.output_path.clone(),
                columns: config.node.columns,
                topology: ClusterTopology::main(config.node.n_cluster_nodes, local_address),
            };
            (plan, None)
        }
        Command::Sub { .. } => {
            let local_address = parse_address(&config.node.local_host)?;
            let coordinator_address = config
                .node
                .mainhost
                .as_deref()
                .map(parse_address)
                .transpose()?;
            let plan = ExecutionPlan::DistributedSub {
                columns: config.node.columns,
                topology: ClusterTopology {
                    n_cluster_nodes: config.node.n_cluster_nodes,
                    local_address,
                    coordinator_address,
                },
            };
            (plan, None)
        }
    };

    match dispatcher.execute(&params, plan).await? {
        RunOutcome::Scores(scores) => match local_output {
            Some(path) => {
                write_scores(&path, &scores)?;
                tracing::info!(path = %path.display(), columns = scores.len(), "anomaly scores written");
            }
            None => print_scores(&scores)?,
        },
        RunOutcome::Written {
            path,
            n_timestamps,
            n_columns,
        } => {
            tracing::info!(path = %path.display(), n_timestamps, n_columns, "run finished");
        }
        RunOutcome::Reported { columns } => {
            tracing::info!(%columns, "scores delivered to coordinator");
        }
    }

    Ok(())
}

fn print_scores(scores: &[ReconstructedScoreSeries]) -> anyhow::Result<()> {
    write_score_rows(std::io::stdout().lock(), scores)?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

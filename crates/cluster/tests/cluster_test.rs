//! Integration tests for the main/sub rendezvous over localhost TCP.
//!
//! Tests verify registration and rejection, column-ordered merging
//! independent of report order, and failure on lost or silent subs.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use s2gpp_cluster::messages::{Assignment, Frame, Hello, Reject};
use s2gpp_cluster::{
    connect_with_retry, Cancellation, ClusterConfig, ClusterError, MainCoordinator, MainState,
    SubState, SubWorker,
};
use s2gpp_compute::{reconstruct, AnomalyEngine, ReconstructedScoreSeries, ReductionMode};
use s2gpp_core::{ClusterTopology, ColumnBounds, ColumnRange};
use uuid::Uuid;

use common::{fast_config, params, series, FirstValueEngine};

const SETTLE: Duration = Duration::from_millis(200);
const TIMEOUT: Duration = Duration::from_secs(20);

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn bind_main(n: usize, config: ClusterConfig) -> MainCoordinator {
    MainCoordinator::bind(ClusterTopology::main(n, loopback(0)), config)
        .await
        .unwrap()
}

type MainRun = (Result<Vec<ReconstructedScoreSeries>, ClusterError>, Vec<MainState>);
type SubRun = (Result<ColumnRange, ClusterError>, Vec<SubState>);

fn spawn_main(
    mut main: MainCoordinator,
    engine: Arc<dyn AnomalyEngine>,
    n_rows: usize,
    n_columns: usize,
    own: ColumnRange,
) -> tokio::task::JoinHandle<MainRun> {
    tokio::spawn(async move {
        let result = main
            .run(engine, &params(), Arc::new(series(n_rows, n_columns)), own)
            .await;
        (result, main.history().to_vec())
    })
}

fn spawn_sub(
    n: usize,
    advertised: u16,
    coordinator: SocketAddr,
    columns: ColumnBounds,
    engine: Arc<dyn AnomalyEngine>,
) -> tokio::task::JoinHandle<SubRun> {
    tokio::spawn(async move {
        let topology = ClusterTopology::sub(n, loopback(advertised), coordinator);
        let mut sub = SubWorker::new(topology, fast_config()).unwrap();
        let result = sub.run(engine, columns).await;
        (result, sub.history().to_vec())
    })
}

/// Per-timestamp scores the first-value engine yields for column `c`.
fn expected_scores(c: usize, n_rows: usize) -> Vec<f64> {
    let windows: Vec<f64> = (0..n_rows - 2).map(|p| (100 * c + p) as f64).collect();
    reconstruct(&windows, 3, ReductionMode::Mean).unwrap()
}

#[tokio::test]
async fn three_nodes_merge_in_column_order() {
    let main = bind_main(3, fast_config()).await;
    let addr = main.local_addr();

    // Column 1 finishes well after column 2, so reports arrive out of order.
    let slow: Arc<dyn AnomalyEngine> =
        Arc::new(FirstValueEngine::stalling(1, Duration::from_millis(400)));
    let fast: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());

    let main_handle = spawn_main(main, fast.clone(), 12, 3, ColumnRange::new(0, 1).unwrap());
    let sub_a = spawn_sub(3, 17001, addr, ColumnBounds::new(1, 2), slow);
    let sub_b = spawn_sub(3, 17002, addr, ColumnBounds::new(2, 3), fast);

    let (result, history) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    let scores = result.unwrap();
    assert_eq!(scores.iter().map(|s| s.column).collect::<Vec<_>>(), vec![0, 1, 2]);
    for s in &scores {
        assert_eq!(s.scores, expected_scores(s.column, 12));
    }
    assert_eq!(
        history,
        vec![
            MainState::AwaitingWorkers,
            MainState::Dispatching,
            MainState::Collecting,
            MainState::Reconciling,
            MainState::Done,
        ]
    );

    for (handle, range) in [(sub_a, (1, 2)), (sub_b, (2, 3))] {
        let (result, history) = handle.await.unwrap();
        assert_eq!(result.unwrap(), ColumnRange::new(range.0, range.1).unwrap());
        assert_eq!(history.last(), Some(&SubState::Done));
        assert_eq!(history.len(), 5);
    }
}

#[tokio::test]
async fn connection_beyond_cluster_size_is_rejected() {
    let main = bind_main(2, fast_config()).await;
    let addr = main.local_addr();
    let slow: Arc<dyn AnomalyEngine> =
        Arc::new(FirstValueEngine::stalling(1, Duration::from_millis(800)));

    let main_handle = spawn_main(main, slow.clone(), 8, 2, ColumnRange::new(0, 1).unwrap());
    let first = spawn_sub(2, 17011, addr, ColumnBounds::new(1, 2), slow.clone());
    tokio::time::sleep(SETTLE).await;

    let (extra, history) = spawn_sub(2, 17012, addr, ColumnBounds::new(1, 2), slow)
        .await
        .unwrap();
    assert!(
        matches!(extra, Err(ClusterError::TopologyMismatch { .. })),
        "{extra:?}"
    );
    assert_eq!(
        history,
        vec![SubState::Connecting, SubState::AwaitingAssignment, SubState::Failed]
    );

    let (result, _) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    assert_eq!(result.unwrap().len(), 2);
    assert!(first.await.unwrap().0.is_ok());
}

#[tokio::test]
async fn mismatched_hello_is_rejected_and_not_counted() {
    let main = bind_main(2, fast_config()).await;
    let addr = main.local_addr();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    let main_handle = spawn_main(main, engine.clone(), 6, 2, ColumnRange::new(0, 1).unwrap());

    // Wrong cluster size.
    let (wrong_size, _) = spawn_sub(3, 17021, addr, ColumnBounds::new(1, 2), engine.clone())
        .await
        .unwrap();
    assert!(matches!(wrong_size, Err(ClusterError::TopologyMismatch { .. })));

    // Advertising the coordinator's own address.
    let mut impostor = fake_sub(addr, addr.port(), 2).await;
    let reply = impostor.recv().await.unwrap();
    assert_eq!(reply.topic, s2gpp_cluster::topics::REJECT);
    let reject = Reject::from_message(&reply).unwrap();
    assert!(reject.reason.contains("own address"), "{}", reject.reason);

    // The slot is still free for a well-formed sub.
    let (ok, _) = spawn_sub(2, 17022, addr, ColumnBounds::new(1, 2), engine)
        .await
        .unwrap();
    assert_eq!(ok.unwrap(), ColumnRange::new(1, 2).unwrap());

    let (result, _) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    assert_eq!(result.unwrap().len(), 2);
}

/// Connect and register like a sub, but hand the raw connection back.
async fn fake_sub(addr: SocketAddr, advertised: u16, n: usize) -> s2gpp_cluster::Connection {
    let mut conn = connect_with_retry(addr, 20, Duration::from_millis(50), Duration::from_secs(1))
        .await
        .unwrap();
    let hello = Hello {
        advertised: loopback(advertised),
        coordinator: addr,
        n_cluster_nodes: n,
        columns: ColumnBounds::new(1, 0),
    };
    conn.send(&hello.into_message(Uuid::new_v4()).unwrap())
        .await
        .unwrap();
    conn
}

#[tokio::test]
async fn sub_disconnect_fails_main() {
    let main = bind_main(2, fast_config()).await;
    let addr = main.local_addr();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    let main_handle = spawn_main(main, engine, 6, 2, ColumnRange::new(0, 1).unwrap());

    let mut conn = fake_sub(addr, 17031, 2).await;
    let assignment = conn.recv().await.unwrap();
    assert_eq!(assignment.topic, s2gpp_cluster::topics::ASSIGNMENT);
    drop(conn);

    let (result, history) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert!(matches!(err, ClusterError::Protocol { .. }), "{err}");
    assert_eq!(err.context().unwrap().state, "Collecting");
    assert_eq!(history.last(), Some(&MainState::Failed));
    assert!(!history.contains(&MainState::Reconciling));
}

#[tokio::test]
async fn silent_sub_times_out() {
    let config = ClusterConfig {
        collect_timeout_secs: 1,
        ..fast_config()
    };
    let main = bind_main(2, config).await;
    let addr = main.local_addr();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    let main_handle = spawn_main(main, engine, 6, 2, ColumnRange::new(0, 1).unwrap());

    let mut conn = fake_sub(addr, 17041, 2).await;
    conn.recv().await.unwrap();

    let (result, history) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    match result {
        Err(ClusterError::Timeout { context, waited }) => {
            assert_eq!(context.state, "Collecting");
            assert_eq!(waited, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(history.last(), Some(&MainState::Failed));
    drop(conn);
}

#[tokio::test]
async fn cancellation_stops_a_waiting_main() {
    let cancel = Cancellation::new();
    let main = bind_main(3, fast_config()).await.with_cancellation(cancel.clone());
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    let main_handle = spawn_main(main, engine, 6, 3, ColumnRange::new(0, 1).unwrap());

    tokio::time::sleep(SETTLE).await;
    cancel.cancel();

    let (result, history) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClusterError::Cancelled { .. })));
    assert_eq!(history, vec![MainState::AwaitingWorkers, MainState::Failed]);
}

#[tokio::test]
async fn sub_gives_up_after_configured_attempts() {
    // Bind then drop to get a port nothing listens on.
    let dead = tokio::net::TcpListener::bind(loopback(0))
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let config = ClusterConfig {
        connect_attempts: 2,
        connect_backoff_ms: 10,
        ..fast_config()
    };
    let mut sub = SubWorker::new(ClusterTopology::sub(2, loopback(17051), dead), config).unwrap();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());

    let err = tokio::time::timeout(TIMEOUT, sub.run(engine, ColumnBounds::all()))
        .await
        .unwrap()
        .unwrap_err();
    match &err {
        ClusterError::Connection { context, reason } => {
            assert_eq!(context.state, "Connecting");
            assert_eq!(context.peer, Some(dead));
            assert!(reason.contains("2 attempt"), "{reason}");
        }
        other => panic!("expected connection error, got {other}"),
    }
    assert_eq!(sub.history(), &[SubState::Connecting, SubState::Failed]);
}

#[tokio::test]
async fn sub_without_cluster_is_refused_up_front() {
    let err = SubWorker::new(
        ClusterTopology::sub(1, loopback(17061), loopback(17060)),
        fast_config(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ClusterError::TopologyMismatch { .. }));
}

#[tokio::test]
async fn duplicate_advertised_address_is_rejected() {
    let main = bind_main(3, fast_config()).await;
    let addr = main.local_addr();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    let main_handle = spawn_main(main, engine, 6, 3, ColumnRange::new(0, 1).unwrap());

    let _first = fake_sub(addr, 17071, 3).await;
    tokio::time::sleep(SETTLE).await;

    let mut second = fake_sub(addr, 17071, 3).await;
    let reply = tokio::time::timeout(TIMEOUT, second.recv()).await.unwrap().unwrap();
    assert_eq!(reply.topic, s2gpp_cluster::topics::REJECT);
    let reject = Reject::from_message(&reply).unwrap();
    assert!(reject.reason.contains("already registered"), "{}", reject.reason);

    main_handle.abort();
}

#[tokio::test]
async fn sub_that_never_reads_times_out_dispatch() {
    let config = ClusterConfig {
        dispatch_timeout_secs: 1,
        ..fast_config()
    };
    let main = bind_main(2, config).await;
    let addr = main.local_addr();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    // The assignment is far larger than the socket buffers can hold.
    let main_handle = spawn_main(main, engine, 4_000_000, 2, ColumnRange::new(0, 1).unwrap());

    let conn = fake_sub(addr, 17081, 2).await;

    let (result, history) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    match result {
        Err(ClusterError::Timeout { context, waited }) => {
            assert_eq!(context.state, "Dispatching");
            assert!(context.peer.is_some());
            assert_eq!(waited, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(history.last(), Some(&MainState::Failed));
    drop(conn);
}

#[tokio::test]
async fn huge_accept_timeout_still_cancels() {
    let config = ClusterConfig {
        accept_timeout_secs: u64::MAX,
        ..fast_config()
    };
    let cancel = Cancellation::new();
    let main = bind_main(2, config).await.with_cancellation(cancel.clone());
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    let main_handle = spawn_main(main, engine, 6, 2, ColumnRange::new(0, 1).unwrap());

    tokio::time::sleep(SETTLE).await;
    cancel.cancel();

    let (result, history) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClusterError::Cancelled { .. })), "{result:?}");
    assert_eq!(history, vec![MainState::AwaitingWorkers, MainState::Failed]);
}

#[tokio::test]
async fn silent_connection_does_not_hold_up_registration() {
    let config = ClusterConfig {
        handshake_timeout_secs: 8,
        ..fast_config()
    };
    let main = bind_main(2, config).await;
    let addr = main.local_addr();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());
    let started = std::time::Instant::now();
    let main_handle = spawn_main(main, engine.clone(), 6, 2, ColumnRange::new(0, 1).unwrap());

    // Connects first and never says hello.
    let silent = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    let sub = spawn_sub(2, 17111, addr, ColumnBounds::new(1, 2), engine);

    let (result, _) = tokio::time::timeout(TIMEOUT, main_handle).await.unwrap().unwrap();
    assert_eq!(result.unwrap().len(), 2);
    assert!(sub.await.unwrap().0.is_ok());
    assert!(started.elapsed() < Duration::from_secs(8));
    drop(silent);
}

#[tokio::test]
async fn sub_times_out_waiting_for_assignment() {
    // Accepts the sub and then says nothing.
    let listener = tokio::net::TcpListener::bind(loopback(0)).await.unwrap();
    let coordinator = listener.local_addr().unwrap();
    let held = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(TIMEOUT).await;
        drop(stream);
    });

    let config = ClusterConfig {
        assignment_timeout_secs: 1,
        ..fast_config()
    };
    let mut sub = SubWorker::new(ClusterTopology::sub(2, loopback(17091), coordinator), config).unwrap();
    let engine: Arc<dyn AnomalyEngine> = Arc::new(FirstValueEngine::default());

    let err = tokio::time::timeout(TIMEOUT, sub.run(engine, ColumnBounds::all()))
        .await
        .unwrap()
        .unwrap_err();
    match &err {
        ClusterError::Timeout { context, waited } => {
            assert_eq!(context.state, "AwaitingAssignment");
            assert_eq!(context.peer, Some(coordinator));
            assert_eq!(*waited, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert_eq!(
        sub.history(),
        &[SubState::Connecting, SubState::AwaitingAssignment, SubState::Failed]
    );
    held.abort();
}

#[tokio::test]
async fn report_to_a_vanished_coordinator_is_an_uplink_failure() {
    // Hands out one large assignment, then closes before the report.
    let listener = tokio::net::TcpListener::bind(loopback(0)).await.unwrap();
    let coordinator = listener.local_addr().unwrap();
    let fake_main = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = s2gpp_cluster::Connection::new(stream).unwrap();
        conn.recv().await.unwrap();
        let run_id = Uuid::new_v4();
        let range = ColumnRange::new(0, 1).unwrap();
        let assignment = Assignment {
            run_id,
            range,
            params: params(),
            series: series(2_000_000, 1),
        };
        conn.send(&assignment.into_message(run_id).unwrap())
            .await
            .unwrap();
        drop(conn);
    });

    let mut sub = SubWorker::new(
        ClusterTopology::sub(2, loopback(17101), coordinator),
        fast_config(),
    )
    .unwrap();
    let slow: Arc<dyn AnomalyEngine> =
        Arc::new(FirstValueEngine::stalling(0, Duration::from_millis(500)));

    let err = tokio::time::timeout(TIMEOUT, sub.run(slow, ColumnBounds::all()))
        .await
        .unwrap()
        .unwrap_err();
    match &err {
        ClusterError::Uplink { context, .. } => {
            assert_eq!(context.state, "Reporting");
            assert_eq!(context.peer, Some(coordinator));
        }
        other => panic!("expected uplink failure, got {other}"),
    }
    assert_eq!(sub.history().last(), Some(&SubState::Failed));
    assert!(sub.history().contains(&SubState::Reporting));
    fake_main.await.unwrap();
}

use super::*;
use crate::{
    Connection, Error, HandlerError, HandlerFactory, HandlerMode, LoadBalancePolicy, PoolConfig,
    Request, Response, control::ExitReason, handler_factory,
};
use core::time::Duration;
use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::{
    sync::oneshot,
    time::{Instant, sleep, timeout},
};

/// In-memory connection. Reading blocks until the gate opens (if any); the
/// response is delivered to the test over a oneshot.
struct MockConnection {
    request: Request,
    gate: Option<oneshot::Receiver<()>>,
    reply: Option<oneshot::Sender<Response>>,
}

impl Connection for MockConnection {
    async fn read_request(&mut self) -> io::Result<Request> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
        Ok(self.request.clone())
    }

    async fn write_response(&mut self, response: Response) -> io::Result<()> {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(response);
        }
        Ok(())
    }
}

fn client(path: &str) -> (MockConnection, oneshot::Receiver<Response>) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let conn = MockConnection {
        request: Request::get(path),
        gate: None,
        reply: Some(reply_tx),
    };
    (conn, reply_rx)
}

fn gated_client(
    path: &str,
) -> (
    MockConnection,
    oneshot::Sender<()>,
    oneshot::Receiver<Response>,
) {
    let (gate_tx, gate_rx) = oneshot::channel();
    let (mut conn, reply_rx) = client(path);
    conn.gate = Some(gate_rx);
    (conn, gate_tx, reply_rx)
}

fn route(req: &Request) -> Result<Response, HandlerError> {
    match req.path.as_str() {
        "/" => Ok(Response::ok("Hello World!")),
        "/whoami" => Ok(Response::ok(
            std::thread::current().name().unwrap_or_default().to_string(),
        )),
        "/crash" => panic!("handler crashed"),
        "/block" => {
            std::thread::sleep(Duration::from_millis(1_500));
            Ok(Response::ok("late"))
        }
        _ => Err(HandlerError::not_found(&req.path)),
    }
}

fn test_factory() -> HandlerFactory {
    handler_factory(|| Ok(route))
}

/// Handler initialisation takes 600ms while `slow` is set.
fn slow_factory(slow: Arc<AtomicBool>) -> HandlerFactory {
    handler_factory(move || {
        if slow.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(600));
        }
        Ok(route)
    })
}

/// Handler initialisation fails while `broken` is set.
fn switchable_factory(broken: Arc<AtomicBool>) -> HandlerFactory {
    handler_factory(move || {
        if broken.load(Ordering::SeqCst) {
            Err(HandlerError::internal("dependency unavailable"))
        } else {
            Ok(route)
        }
    })
}

fn fast_config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(250),
        drain_timeout: Duration::from_secs(1),
        startup_timeout: Duration::from_secs(2),
        restart_crash_window: Duration::from_secs(10),
        restart_crash_limit: 2,
        load_balance_policy: LoadBalancePolicy::RoundRobin,
        handler_mode: HandlerMode::Offload,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

fn pids(supervisor: &Supervisor<MockConnection>) -> Vec<WorkerPid> {
    supervisor.snapshot().iter().map(|w| w.pid).collect()
}

fn all_ready(supervisor: &Supervisor<MockConnection>) -> bool {
    let snapshot = supervisor.snapshot();
    snapshot.len() == supervisor.config().workers
        && snapshot.iter().all(|w| w.status == WorkerStatus::Ready)
}

#[tokio::test(flavor = "multi_thread")]
async fn start_brings_every_worker_up() {
    for n in 1..=4 {
        let supervisor = Supervisor::start(fast_config(n), test_factory())
            .await
            .unwrap();

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.len(), n);
        assert!(snapshot.iter().all(|w| w.status.is_serving()));
        assert_eq!(
            snapshot.iter().map(|w| w.id).collect::<Vec<_>>(),
            (0..n).map(WorkerId).collect::<Vec<_>>()
        );

        let unique: HashSet<_> = pids(&supervisor).into_iter().collect();
        assert_eq!(unique.len(), n);

        supervisor.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_rejects_empty_pool() {
    let result = Supervisor::<MockConnection>::start(fast_config(0), test_factory()).await;
    assert!(matches!(result, Err(Error::Startup { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_fails_when_handler_init_fails() {
    let broken = Arc::new(AtomicBool::new(true));
    let result =
        Supervisor::<MockConnection>::start(fast_config(2), switchable_factory(broken)).await;
    assert!(matches!(result, Err(Error::Startup { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_fails_when_workers_are_too_slow() {
    let factory = handler_factory(|| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(route)
    });
    let config = PoolConfig {
        startup_timeout: Duration::from_millis(100),
        ..fast_config(2)
    };

    let started = Instant::now();
    let result = Supervisor::<MockConnection>::start(config, factory).await;
    assert!(matches!(result, Err(Error::Startup { .. })));
    assert!(started.elapsed() < Duration::from_millis(450));
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_assigns_in_pool_order() {
    let supervisor = Supervisor::start(fast_config(3), test_factory())
        .await
        .unwrap();

    let mut replies = Vec::new();
    let mut workers = Vec::new();
    for _ in 0..4 {
        let (conn, reply) = client("/");
        workers.push(supervisor.assign(conn).unwrap().worker);
        replies.push(reply);
    }
    assert_eq!(workers, vec![WorkerId(0), WorkerId(1), WorkerId(2), WorkerId(0)]);

    for reply in replies {
        assert_eq!(reply.await.unwrap(), Response::ok("Hello World!"));
    }
    eventually("connections to close", || {
        supervisor
            .snapshot()
            .iter()
            .all(|w| w.active_connections == 0 && w.status == WorkerStatus::Ready)
    })
    .await;

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_errors_reach_the_client() {
    let supervisor = Supervisor::start(fast_config(1), test_factory())
        .await
        .unwrap();

    let (conn, reply) = client("/missing");
    supervisor.assign(conn).unwrap();
    assert_eq!(reply.await.unwrap().status, 404);

    // In offload mode a panicking handler only fails its own request.
    let pid = pids(&supervisor)[0];
    let (conn, reply) = client("/crash");
    supervisor.assign(conn).unwrap();
    assert_eq!(reply.await.unwrap().status, 500);
    assert_eq!(pids(&supervisor), vec![pid]);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn least_connections_prefers_idle_workers() {
    let config = PoolConfig {
        load_balance_policy: LoadBalancePolicy::LeastConnections,
        ..fast_config(3)
    };
    let supervisor = Supervisor::start(config, test_factory()).await.unwrap();

    let (first, first_gate, first_reply) = gated_client("/");
    let (second, second_gate, second_reply) = gated_client("/");
    assert_eq!(supervisor.assign(first).unwrap().worker, WorkerId(0));
    assert_eq!(supervisor.assign(second).unwrap().worker, WorkerId(1));
    assert_eq!(supervisor.snapshot()[0].status, WorkerStatus::Busy);

    first_gate.send(()).unwrap();
    first_reply.await.unwrap();
    eventually("worker 0 to go idle", || {
        supervisor.snapshot()[0].active_connections == 0
    })
    .await;

    // Workers 0 and 2 are idle; pool order breaks the tie.
    let (third, third_reply) = client("/");
    assert_eq!(supervisor.assign(third).unwrap().worker, WorkerId(0));
    third_reply.await.unwrap();

    second_gate.send(()).unwrap();
    second_reply.await.unwrap();
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rolling_restart_keeps_capacity() {
    let supervisor = Arc::new(
        Supervisor::start(fast_config(3), test_factory())
            .await
            .unwrap(),
    );
    let before = pids(&supervisor);

    // An in-flight request on worker 0 must survive its drain.
    let (conn, gate, reply) = gated_client("/");
    assert_eq!(supervisor.assign(conn).unwrap().worker, WorkerId(0));

    let done = Arc::new(AtomicBool::new(false));
    let min_serving = Arc::new(AtomicUsize::new(usize::MAX));
    let sampler = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        let done = Arc::clone(&done);
        let min_serving = Arc::clone(&min_serving);
        async move {
            while !done.load(Ordering::SeqCst) {
                min_serving.fetch_min(supervisor.serving_count(), Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
            }
        }
    });
    let release = tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        let _ = gate.send(());
    });

    let report = supervisor.rolling_restart().await.unwrap();
    done.store(true, Ordering::SeqCst);
    sampler.await.unwrap();
    release.await.unwrap();

    assert_eq!(report.restarted, vec![WorkerId(0), WorkerId(1), WorkerId(2)]);
    assert!(report.skipped.is_empty());
    assert!(report.drain_timeouts.is_empty());
    assert_eq!(reply.await.unwrap(), Response::ok("Hello World!"));
    assert!(min_serving.load(Ordering::SeqCst) >= 2);

    let after = pids(&supervisor);
    assert_eq!(after.len(), 3);
    assert!(after.iter().all(|pid| !before.contains(pid)));
    assert!(all_ready(&supervisor));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_timeout_forces_termination() {
    let config = PoolConfig {
        drain_timeout: Duration::from_millis(200),
        ..fast_config(2)
    };
    let supervisor = Supervisor::start(config, test_factory()).await.unwrap();

    // The gate is never opened, so worker 0 can never finish draining.
    let (conn, _gate, reply) = gated_client("/");
    assert_eq!(supervisor.assign(conn).unwrap().worker, WorkerId(0));

    let report = supervisor.rolling_restart().await.unwrap();
    assert_eq!(report.restarted, vec![WorkerId(0), WorkerId(1)]);
    assert_eq!(report.drain_timeouts, vec![WorkerId(0)]);
    assert!(report.elapsed >= Duration::from_millis(200));

    // The stuck connection went down with its worker.
    let lost = timeout(Duration::from_secs(2), reply).await.unwrap();
    assert!(lost.is_err());
    assert!(all_ready(&supervisor));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_rolling_restarts_run_one_after_the_other() {
    let supervisor = Arc::new(
        Supervisor::start(fast_config(2), test_factory())
            .await
            .unwrap(),
    );

    let (a, b) = tokio::join!(supervisor.rolling_restart(), supervisor.rolling_restart());
    assert_eq!(a.unwrap().restarted.len(), 2);
    assert_eq!(b.unwrap().restarted.len(), 2);
    assert!(all_ready(&supervisor));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_while_busy_drops_connections_and_respawns() {
    let config = PoolConfig {
        handler_mode: HandlerMode::Inline,
        ..fast_config(1)
    };
    let supervisor = Supervisor::start(config, test_factory()).await.unwrap();
    let pid = pids(&supervisor)[0];

    let (crashing, gate, crash_reply) = gated_client("/crash");
    let (queued, _queued_gate, queued_reply) = gated_client("/");
    supervisor.assign(crashing).unwrap();
    supervisor.assign(queued).unwrap();
    assert_eq!(supervisor.snapshot()[0].active_connections, 2);

    gate.send(()).unwrap();
    assert!(crash_reply.await.is_err());
    assert!(queued_reply.await.is_err());

    eventually("a replacement worker", || {
        let snapshot = supervisor.snapshot();
        snapshot.len() == 1
            && snapshot[0].pid != pid
            && snapshot[0].status == WorkerStatus::Ready
            && snapshot[0].active_connections == 0
    })
    .await;

    let (conn, reply) = client("/");
    supervisor.assign(conn).unwrap();
    assert_eq!(reply.await.unwrap(), Response::ok("Hello World!"));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unresponsive_worker_is_replaced() {
    let config = PoolConfig {
        handler_mode: HandlerMode::Inline,
        ..fast_config(1)
    };
    let supervisor = Supervisor::start(config, test_factory()).await.unwrap();
    let pid = pids(&supervisor)[0];

    // Blocks the worker's event loop, so no heartbeats go out.
    let (conn, mut reply) = client("/block");
    let assigned = Instant::now();
    supervisor.assign(conn).unwrap();

    eventually("the silent worker to be declared dead", || {
        let snapshot = supervisor.snapshot();
        !snapshot.iter().any(|w| w.pid == pid && w.status != WorkerStatus::Dead)
    })
    .await;
    let detected = assigned.elapsed();
    let config = supervisor.config();
    assert!(
        detected <= config.heartbeat_timeout + config.heartbeat_interval + Duration::from_millis(150),
        "detected after {detected:?}"
    );

    eventually("the silent worker to be replaced", || {
        let snapshot = supervisor.snapshot();
        snapshot[0].pid != pid && snapshot[0].status == WorkerStatus::Ready
    })
    .await;
    // Replaced while the old handler call was still running.
    assert!(reply.try_recv().is_err());

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_client_does_not_block_inline_worker() {
    let config = PoolConfig {
        handler_mode: HandlerMode::Inline,
        ..fast_config(1)
    };
    let supervisor = Supervisor::start(config, test_factory()).await.unwrap();
    let pid = pids(&supervisor)[0];

    // Connects and never sends its request.
    let (idle, _idle_gate, _idle_reply) = gated_client("/");
    supervisor.assign(idle).unwrap();

    let (conn, reply) = client("/");
    supervisor.assign(conn).unwrap();
    let response = timeout(Duration::from_secs(2), reply)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, Response::ok("Hello World!"));

    eventually("the answered connection to close", || {
        supervisor.snapshot()[0].active_connections == 1
    })
    .await;
    assert_eq!(pids(&supervisor), vec![pid]);

    // Drain waits on the idle client until the drain timeout.
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_replacement_completes_rolling_restart() {
    let slow = Arc::new(AtomicBool::new(false));
    let supervisor = Supervisor::start(fast_config(1), slow_factory(Arc::clone(&slow)))
        .await
        .unwrap();
    let before = pids(&supervisor)[0];

    // Slower than heartbeat_timeout, well inside startup_timeout.
    slow.store(true, Ordering::SeqCst);
    let report = supervisor.rolling_restart().await.unwrap();

    assert_eq!(report.restarted, vec![WorkerId(0)]);
    assert!(supervisor.degraded().is_empty());
    // The first successor made it; nothing was respawned along the way.
    assert_eq!(pids(&supervisor), vec![WorkerPid(before.0 + 1)]);
    assert!(all_ready(&supervisor));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_intake_falls_through_to_the_next_worker() {
    let supervisor = Supervisor::start(fast_config(2), test_factory())
        .await
        .unwrap();

    supervisor.close_intake(WorkerId(0));
    let (conn, reply) = client("/");
    assert_eq!(supervisor.assign(conn).unwrap().worker, WorkerId(1));
    assert_eq!(reply.await.unwrap(), Response::ok("Hello World!"));
    assert!(!supervisor.snapshot()[0].status.is_serving());

    supervisor.close_intake(WorkerId(1));
    let (conn, _reply) = client("/again");
    let rejected = supervisor.try_assign(conn).unwrap_err();
    assert_eq!(rejected.error, Error::NoCapacity);
    assert_eq!(rejected.connection.request.path, "/again");

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn handlers_run_on_threads_named_after_their_worker() {
    for mode in [HandlerMode::Offload, HandlerMode::Inline] {
        let config = PoolConfig {
            handler_mode: mode,
            ..fast_config(2)
        };
        let supervisor = Supervisor::start(config, test_factory()).await.unwrap();

        for expected in ["worker-0", "worker-1"] {
            let (conn, reply) = client("/whoami");
            supervisor.assign(conn).unwrap();
            assert_eq!(reply.await.unwrap(), Response::ok(expected), "{mode:?}");
        }

        supervisor.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn offloaded_handlers_keep_heartbeats_going() {
    let supervisor = Supervisor::start(fast_config(1), test_factory())
        .await
        .unwrap();
    let pid = pids(&supervisor)[0];

    let (conn, reply) = client("/block");
    supervisor.assign(conn).unwrap();
    assert_eq!(reply.await.unwrap(), Response::ok("late"));
    assert_eq!(pids(&supervisor), vec![pid]);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_loop_suspends_only_the_failing_slot() {
    let broken = Arc::new(AtomicBool::new(false));
    let config = PoolConfig {
        handler_mode: HandlerMode::Inline,
        ..fast_config(3)
    };
    let supervisor = Supervisor::start(config, switchable_factory(Arc::clone(&broken)))
        .await
        .unwrap();
    let mut degraded = supervisor.subscribe_degraded();

    let (warmup, warmup_reply) = client("/");
    assert_eq!(supervisor.assign(warmup).unwrap().worker, WorkerId(0));
    warmup_reply.await.unwrap();

    // Every replacement for slot 1 fails to initialise from here on.
    broken.store(true, Ordering::SeqCst);
    let (crash, _reply) = client("/crash");
    assert_eq!(supervisor.assign(crash).unwrap().worker, WorkerId(1));

    timeout(Duration::from_secs(5), degraded.wait_for(|ids| !ids.is_empty()))
        .await
        .unwrap()
        .unwrap();
    broken.store(false, Ordering::SeqCst);
    assert_eq!(supervisor.degraded(), vec![WorkerId(1)]);
    assert!(!supervisor.is_exhausted());

    // The suspended slot stays down; the others keep serving.
    sleep(Duration::from_millis(100)).await;
    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot[1].status, WorkerStatus::Dead);
    assert!(snapshot[0].status.is_serving());
    assert!(snapshot[2].status.is_serving());

    for _ in 0..4 {
        let (conn, reply) = client("/");
        assert_ne!(supervisor.assign(conn).unwrap().worker, WorkerId(1));
        reply.await.unwrap();
    }

    let report = supervisor.rolling_restart().await.unwrap();
    assert_eq!(report.restarted, vec![WorkerId(0), WorkerId(2)]);
    assert_eq!(report.skipped, vec![WorkerId(1)]);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_pool_has_no_capacity() {
    let broken = Arc::new(AtomicBool::new(false));
    let config = PoolConfig {
        handler_mode: HandlerMode::Inline,
        ..fast_config(1)
    };
    let supervisor = Supervisor::start(config, switchable_factory(Arc::clone(&broken)))
        .await
        .unwrap();

    broken.store(true, Ordering::SeqCst);
    let (crash, _reply) = client("/crash");
    supervisor.assign(crash).unwrap();

    eventually("the only slot to be suspended", || supervisor.is_exhausted()).await;
    let (conn, _reply) = client("/");
    assert_eq!(supervisor.assign(conn), Err(Error::NoCapacity));

    // The caller gets the connection back to answer it.
    let (conn, _reply) = client("/again");
    let rejected = supervisor.try_assign(conn).unwrap_err();
    assert_eq!(rejected.error, Error::NoCapacity);
    assert_eq!(rejected.connection.request.path, "/again");

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reported_exit_replaces_the_worker() {
    let supervisor = Supervisor::start(fast_config(2), test_factory())
        .await
        .unwrap();
    let before = pids(&supervisor);

    // Unknown incarnations are ignored.
    supervisor.on_worker_exit(WorkerPid(9_999), ExitReason::Crashed("ghost".into()));
    assert_eq!(pids(&supervisor), before);

    supervisor.on_worker_exit(before[1], ExitReason::Crashed("killed".into()));
    eventually("slot 1 to be replaced", || {
        let snapshot = supervisor.snapshot();
        snapshot.len() == 2
            && snapshot[0].pid == before[0]
            && snapshot[1].pid != before[1]
            && snapshot[1].status == WorkerStatus::Ready
    })
    .await;

    // A second report for the same incarnation changes nothing.
    let after = pids(&supervisor);
    supervisor.on_worker_exit(before[1], ExitReason::Crashed("killed".into()));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(pids(&supervisor), after);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_routing_and_is_idempotent() {
    let supervisor = Supervisor::start(fast_config(2), test_factory())
        .await
        .unwrap();

    let (conn, gate, reply) = gated_client("/");
    supervisor.assign(conn).unwrap();
    let release = tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        let _ = gate.send(());
    });

    supervisor.shutdown().await.unwrap();
    release.await.unwrap();
    assert_eq!(reply.await.unwrap(), Response::ok("Hello World!"));

    let (conn, _reply) = client("/");
    assert_eq!(supervisor.assign(conn), Err(Error::ServiceShutdown));
    assert!(
        supervisor
            .snapshot()
            .iter()
            .all(|w| w.status == WorkerStatus::Dead)
    );
    assert_eq!(supervisor.rolling_restart().await, Err(Error::ServiceShutdown));

    supervisor.shutdown().await.unwrap();
}

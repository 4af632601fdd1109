//! Worker incarnations.
//!
//! Each worker runs on a dedicated OS thread that owns a single-threaded
//! Tokio runtime: its own event loop. Assigned connections arrive over an
//! unbounded MPSC queue (the dispatcher already counted them, so the queue
//! never holds unassigned work) and directives arrive over the control
//! channel.
//!
//! The heartbeat runs as a separate task on the same event loop, and so does
//! connection I/O: a client that never sends its request only occupies its
//! own task. In [`HandlerMode::Offload`] handler calls go to the runtime's
//! blocking pool, so the loop keeps ticking while a handler computes. In
//! [`HandlerMode::Inline`] handler calls run on the loop itself and a slow
//! handler starves the heartbeat; the supervisor's monitor notices the
//! silence and replaces the worker.

use crate::{
    HandlerMode,
    control::{self, ControlMessage, ExitReason, Reporter, SupervisorEnd, WorkerEnd},
    handler::{Connection, HandlerFactory, Request, Response, SharedHandler},
    pool::{WorkerId, WorkerPid},
};
use core::time::Duration;
use std::{io, thread};
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

/// Supervisor-side handle on a running worker incarnation.
pub(crate) struct WorkerHandle<C> {
    connections: mpsc::UnboundedSender<C>,
    control: SupervisorEnd,
    cancel: CancellationToken,
    // Dropping the join handle detaches the thread. A worker wedged inside an
    // inline handler is left to finish on its own.
    _thread: thread::JoinHandle<()>,
}

impl<C> WorkerHandle<C> {
    /// Hands an assigned connection to the worker. Gives the connection back
    /// if the worker's intake is closed.
    pub(crate) fn deliver(&self, conn: C) -> Result<(), C> {
        self.connections.send(conn).map_err(|e| e.0)
    }

    /// Drops the intake without stopping the worker.
    #[cfg(test)]
    pub(crate) fn close_intake(&mut self) {
        self.connections = mpsc::unbounded_channel().0;
    }

    pub(crate) fn request_drain(&self) -> bool {
        self.control.send(ControlMessage::DrainRequest)
    }

    /// Asks the worker to stop now and cancels its token so it also stops if
    /// the directive queue is not being read.
    pub(crate) fn terminate(&self) {
        let _ = self.control.send(ControlMessage::Shutdown);
        self.cancel.cancel();
    }
}

/// Everything a new worker thread needs.
pub(crate) struct WorkerSpec {
    pub(crate) id: WorkerId,
    pub(crate) pid: WorkerPid,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) mode: HandlerMode,
    pub(crate) factory: HandlerFactory,
}

/// Spawns a worker thread and returns the supervisor's handle on it.
///
/// `reports` is the supervisor's shared inbound control queue; `parent` is
/// the supervisor's cancellation token, so a pool shutdown reaches every
/// worker.
pub(crate) fn spawn<C: Connection>(
    spec: WorkerSpec,
    reports: mpsc::UnboundedSender<control::Envelope>,
    parent: &CancellationToken,
) -> io::Result<WorkerHandle<C>> {
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    let (supervisor_end, worker_end) = control::channel(spec.pid, reports);
    let cancel = parent.child_token();
    let worker_cancel = cancel.clone();

    let thread = thread::Builder::new()
        .name(format!("worker-{}", spec.id))
        .spawn(move || run_thread(spec, conn_rx, worker_end, worker_cancel))?;

    Ok(WorkerHandle {
        connections: conn_tx,
        control: supervisor_end,
        cancel,
        _thread: thread,
    })
}

/// Reports `Exited` exactly once, including when the thread unwinds.
struct ExitGuard {
    reporter: Reporter,
    reason: Option<ExitReason>,
}

impl ExitGuard {
    fn new(reporter: Reporter) -> Self {
        Self {
            reporter,
            reason: None,
        }
    }

    fn exit(mut self, reason: ExitReason) {
        self.reason = Some(reason);
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reason = self.reason.take().unwrap_or_else(|| {
            ExitReason::Crashed(if thread::panicking() {
                "worker panicked".to_string()
            } else {
                "worker stopped without reporting".to_string()
            })
        });
        let _ = self.reporter.report(ControlMessage::Exited(reason));
    }
}

fn run_thread<C: Connection>(
    spec: WorkerSpec,
    connections: mpsc::UnboundedReceiver<C>,
    control: WorkerEnd,
    cancel: CancellationToken,
) {
    let guard = ExitGuard::new(control.reporter());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .thread_name(format!("worker-{}", spec.id))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            guard.exit(ExitReason::Crashed(format!("failed to build runtime: {e}")));
            return;
        }
    };

    let reason = runtime.block_on(serve(spec, connections, control, cancel));
    // Abandon any blocking handler calls still running so the thread exits.
    runtime.shutdown_background();
    guard.exit(reason);
}

/// The worker loop: build the handler, report ready, then serve assigned
/// connections until drained, shut down or cancelled.
#[tracing::instrument(skip_all, fields(worker = %spec.id, pid = %spec.pid))]
async fn serve<C: Connection>(
    spec: WorkerSpec,
    mut connections: mpsc::UnboundedReceiver<C>,
    mut control: WorkerEnd,
    cancel: CancellationToken,
) -> ExitReason {
    let handler = match (spec.factory)() {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!("Handler initialisation failed: {e}");
            return ExitReason::Crashed(format!("handler initialisation failed: {e}"));
        }
    };

    let heartbeat = tokio::spawn(emit_heartbeats(
        control.reporter(),
        spec.heartbeat_interval,
        cancel.clone(),
    ));
    control.report(ControlMessage::Ready);
    tracing::debug!("Worker ready");

    let mut in_flight = JoinSet::new();
    let mut draining = false;
    let mut intake_open = true;

    let reason = loop {
        if draining && !intake_open && in_flight.is_empty() {
            control.report(ControlMessage::DrainAck);
            tracing::debug!("Worker drained");
            break ExitReason::Drained;
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => break ExitReason::Shutdown,

            directive = control.recv() => match directive {
                Some(ControlMessage::DrainRequest) => {
                    tracing::debug!("Drain requested ({} in flight)", in_flight.len());
                    draining = true;
                    // Already-assigned connections stay queued and are served.
                    connections.close();
                }
                Some(ControlMessage::Shutdown) | None => break ExitReason::Shutdown,
                Some(other) => tracing::warn!("Ignoring unexpected directive {other:?}"),
            },

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                Ok(Step::Done) => {}
                // Inline mode: the handler runs right here and blocks the loop.
                Ok(Step::Handle(conn, request)) => {
                    let response = handler.handle(&request).unwrap_or_else(Response::from);
                    in_flight.spawn(respond(conn, response, control.reporter()));
                }
                Err(e) => tracing::warn!("Connection task failed: {e}"),
            },

            conn = connections.recv(), if intake_open => match conn {
                Some(conn) => match spec.mode {
                    HandlerMode::Offload => {
                        in_flight.spawn(serve_offloaded(conn, handler.clone(), control.reporter()));
                    }
                    HandlerMode::Inline => {
                        in_flight.spawn(read_for_inline(conn, control.reporter()));
                    }
                },
                None => intake_open = false,
            },
        }
    };

    heartbeat.abort();
    in_flight.abort_all();
    reason
}

async fn emit_heartbeats(reporter: Reporter, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if !reporter.report(ControlMessage::Heartbeat) {
                    return;
                }
            }
        }
    }
}

/// Where a connection task left off.
enum Step<C> {
    /// Closed and reported as `Completed`.
    Done,
    /// Request read; the handler has to run on the event loop.
    Handle(C, Request),
}

/// Serves one connection with the handler on the blocking pool. Handler
/// errors and panics become error responses.
async fn serve_offloaded<C: Connection>(
    mut conn: C,
    handler: SharedHandler,
    reporter: Reporter,
) -> Step<C> {
    let request = match conn.read_request().await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Failed to read request: {e}");
            reporter.report(ControlMessage::Completed);
            return Step::Done;
        }
    };
    let response = match tokio::task::spawn_blocking(move || handler.handle(&request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => e.into(),
        Err(e) => {
            tracing::error!("Handler panicked: {e}");
            Response::with_status(500, "Internal Server Error")
        }
    };
    respond(conn, response, reporter).await
}

/// Reads the request of an inline-mode connection off the event loop. A
/// handler panic on the loop unwinds out of the worker and kills it.
async fn read_for_inline<C: Connection>(mut conn: C, reporter: Reporter) -> Step<C> {
    match conn.read_request().await {
        Ok(request) => Step::Handle(conn, request),
        Err(e) => {
            tracing::debug!("Failed to read request: {e}");
            reporter.report(ControlMessage::Completed);
            Step::Done
        }
    }
}

async fn respond<C: Connection>(mut conn: C, response: Response, reporter: Reporter) -> Step<C> {
    if let Err(e) = conn.write_response(response).await {
        tracing::debug!("Failed to write response: {e}");
    }
    reporter.report(ControlMessage::Completed);
    Step::Done
}

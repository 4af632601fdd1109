//! Message link between the supervisor and its workers.
//!
//! Every worker incarnation gets its own inbound queue for directives
//! (`DrainRequest`, `Shutdown`) and shares one outbound queue with all other
//! workers for reports, each tagged with the sender's [`WorkerPid`]. Reports
//! from one worker arrive in the order they were sent. Reports from a pid the
//! supervisor no longer tracks are dropped, and a duplicate `Heartbeat` or
//! `Ready` only refreshes `last_heartbeat_at`.

use crate::pool::WorkerPid;
use core::fmt;
use tokio::sync::mpsc;

/// Why a worker incarnation stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Finished in-flight work after a `DrainRequest`.
    Drained,
    /// Stopped on `Shutdown`, cancellation or loss of the control link.
    Shutdown,
    /// Panicked or failed to initialise.
    Crashed(String),
    /// Declared dead by the heartbeat monitor.
    Unresponsive,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Drained => write!(f, "drained"),
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Crashed(reason) => write!(f, "crashed: {reason}"),
            ExitReason::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

/// The control message set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Worker -> supervisor, on a fixed interval.
    Heartbeat,
    /// Worker -> supervisor, once the handler is built and the loop runs.
    Ready,
    /// Supervisor -> worker: stop taking work, finish in-flight, then exit.
    DrainRequest,
    /// Worker -> supervisor: drain finished with zero in-flight connections.
    DrainAck,
    /// Supervisor -> worker: exit now.
    Shutdown,
    /// Worker -> supervisor: this incarnation is gone.
    Exited(ExitReason),
    /// Worker -> supervisor: one assigned connection has been closed.
    Completed,
}

/// A report from a worker, tagged with its pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub pid: WorkerPid,
    pub message: ControlMessage,
}

/// The worker's half of the control channel.
#[derive(Debug)]
pub struct WorkerEnd {
    pid: WorkerPid,
    reports: mpsc::UnboundedSender<Envelope>,
    directives: mpsc::UnboundedReceiver<ControlMessage>,
}

impl WorkerEnd {
    pub fn pid(&self) -> WorkerPid {
        self.pid
    }

    /// Sends a report to the supervisor. Returns `false` once the supervisor
    /// has gone away.
    pub fn report(&self, message: ControlMessage) -> bool {
        report(&self.reports, self.pid, message)
    }

    /// A cloneable sender for tasks that report independently of the worker
    /// loop (heartbeats, per-connection completions).
    pub fn reporter(&self) -> Reporter {
        Reporter {
            pid: self.pid,
            reports: self.reports.clone(),
        }
    }

    /// Next directive from the supervisor. `None` once the supervisor dropped
    /// its side.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.directives.recv().await
    }
}

/// Report-only handle to the control channel.
#[derive(Debug, Clone)]
pub struct Reporter {
    pid: WorkerPid,
    reports: mpsc::UnboundedSender<Envelope>,
}

impl Reporter {
    pub fn report(&self, message: ControlMessage) -> bool {
        report(&self.reports, self.pid, message)
    }
}

fn report(tx: &mpsc::UnboundedSender<Envelope>, pid: WorkerPid, message: ControlMessage) -> bool {
    tx.send(Envelope { pid, message }).is_ok()
}

/// The supervisor's handle on one worker's directive queue.
#[derive(Debug, Clone)]
pub struct SupervisorEnd {
    directives: mpsc::UnboundedSender<ControlMessage>,
}

impl SupervisorEnd {
    pub fn send(&self, message: ControlMessage) -> bool {
        self.directives.send(message).is_ok()
    }
}

/// Creates the control link for a new worker incarnation. `reports` is the
/// supervisor's shared inbound queue.
pub fn channel(pid: WorkerPid, reports: mpsc::UnboundedSender<Envelope>) -> (SupervisorEnd, WorkerEnd) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SupervisorEnd { directives: tx },
        WorkerEnd {
            pid,
            reports,
            directives: rx,
        },
    )
}

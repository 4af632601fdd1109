use super::{dispatcher::Assignable, worker::WorkerHandle};
use core::{fmt, time::Duration};
use std::collections::VecDeque;
use tokio::time::Instant;

/// Slot index of a worker in the pool. A replacement inherits the id of the
/// worker it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of one worker incarnation, unique within a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerPid(pub u64);

impl fmt::Display for WorkerPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Draining,
    Dead,
}

impl WorkerStatus {
    /// `Ready` and `Busy` workers accept new connections.
    pub const fn is_serving(self) -> bool {
        matches!(self, WorkerStatus::Ready | WorkerStatus::Busy)
    }
}

/// Read-only copy of a [`WorkerRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pid: WorkerPid,
    pub status: WorkerStatus,
    pub last_heartbeat_at: Instant,
    pub active_connections: usize,
}

/// Supervisor-owned state of one worker incarnation.
///
/// Workers never touch this; they report over the control channel and the
/// supervisor applies the change.
pub(crate) struct WorkerRecord<C> {
    pub(crate) id: WorkerId,
    pub(crate) pid: WorkerPid,
    pub(crate) status: WorkerStatus,
    pub(crate) spawned_at: Instant,
    pub(crate) last_heartbeat_at: Instant,
    pub(crate) active_connections: usize,
    /// Set when the supervisor asked this incarnation to go away, so its exit
    /// counts as planned.
    pub(crate) retiring: bool,
    pub(crate) drain_acked: bool,
    pub(crate) handle: WorkerHandle<C>,
}

impl<C> WorkerRecord<C> {
    pub(crate) fn new(id: WorkerId, pid: WorkerPid, handle: WorkerHandle<C>, now: Instant) -> Self {
        Self {
            id,
            pid,
            status: WorkerStatus::Starting,
            spawned_at: now,
            last_heartbeat_at: now,
            active_connections: 0,
            retiring: false,
            drain_acked: false,
            handle,
        }
    }

    /// Applies a `Heartbeat` or `Ready`. Idempotent.
    pub(crate) fn heartbeat(&mut self, now: Instant) {
        self.last_heartbeat_at = now;
        if self.status == WorkerStatus::Starting {
            self.status = WorkerStatus::Ready;
        }
    }

    pub(crate) fn connection_opened(&mut self) {
        self.active_connections += 1;
        self.refresh_load();
    }

    pub(crate) fn connection_closed(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
        self.refresh_load();
    }

    fn refresh_load(&mut self) {
        if self.status.is_serving() {
            self.status = if self.active_connections > 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Ready
            };
        }
    }

    /// A `Starting` incarnation has `startup_timeout` from its spawn to
    /// report ready; heartbeats only begin once its handler is built.
    /// Serving incarnations must heartbeat within `heartbeat_timeout`.
    pub(crate) fn is_overdue(
        &self,
        now: Instant,
        heartbeat_timeout: Duration,
        startup_timeout: Duration,
    ) -> bool {
        match self.status {
            WorkerStatus::Starting => {
                now.saturating_duration_since(self.spawned_at) > startup_timeout
            }
            WorkerStatus::Ready | WorkerStatus::Busy => {
                now.saturating_duration_since(self.last_heartbeat_at) > heartbeat_timeout
            }
            WorkerStatus::Draining | WorkerStatus::Dead => false,
        }
    }

    pub(crate) fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            pid: self.pid,
            status: self.status,
            last_heartbeat_at: self.last_heartbeat_at,
            active_connections: self.active_connections,
        }
    }
}

/// Unplanned exits of one slot inside the crash-loop window.
#[derive(Debug, Default)]
pub(crate) struct CrashHistory {
    exits: VecDeque<Instant>,
}

impl CrashHistory {
    /// Records an exit at `now` and returns how many exits fall within
    /// `window` of it, this one included.
    pub(crate) fn record(&mut self, now: Instant, window: Duration) -> usize {
        self.exits.push_back(now);
        while let Some(&oldest) = self.exits.front() {
            if now.saturating_duration_since(oldest) > window {
                self.exits.pop_front();
            } else {
                break;
            }
        }
        self.exits.len()
    }
}

/// One position in the pool: the current incarnation and, while a
/// replacement is starting, its successor.
pub(crate) struct Slot<C> {
    pub(crate) record: WorkerRecord<C>,
    pub(crate) successor: Option<WorkerRecord<C>>,
    pub(crate) crashes: CrashHistory,
    pub(crate) suspended: bool,
}

impl<C> Slot<C> {
    pub(crate) fn new(record: WorkerRecord<C>) -> Self {
        Self {
            record,
            successor: None,
            crashes: CrashHistory::default(),
            suspended: false,
        }
    }

    pub(crate) fn incarnation(&self, pid: WorkerPid) -> Option<&WorkerRecord<C>> {
        if self.record.pid == pid {
            return Some(&self.record);
        }
        self.successor.as_ref().filter(|s| s.pid == pid)
    }

    pub(crate) fn incarnation_mut(&mut self, pid: WorkerPid) -> Option<&mut WorkerRecord<C>> {
        if self.record.pid == pid {
            return Some(&mut self.record);
        }
        self.successor.as_mut().filter(|s| s.pid == pid)
    }

    /// Replaces a dead record with its successor once the successor is ready.
    /// Returns `true` if a promotion happened.
    pub(crate) fn promote_if_ready(&mut self) -> bool {
        match self.successor.take() {
            Some(successor) if successor.status.is_serving() => {
                self.record = successor;
                true
            }
            other => {
                self.successor = other;
                false
            }
        }
    }

    /// Whether this slot needs a new incarnation: nothing live in it, no
    /// planned replacement under way and respawning is not suspended.
    pub(crate) fn needs_respawn(&self) -> bool {
        !self.suspended
            && !self.record.retiring
            && self.record.status == WorkerStatus::Dead
            && self.successor.is_none()
    }
}

impl<C> Assignable for Slot<C> {
    fn status(&self) -> WorkerStatus {
        self.record.status
    }

    fn active_connections(&self) -> usize {
        self.record.active_connections
    }
}

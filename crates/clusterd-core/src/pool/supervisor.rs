//! Pool ownership, crash recovery and zero-downtime restarts.
//!
//! The [`Supervisor`] is the only writer of [`WorkerRecord`]s. Workers report
//! over the control channel; a pump task applies those reports, a monitor
//! task enforces the heartbeat timeout, and `rolling_restart`/`shutdown`
//! drive planned replacements.
//!
//! Waiting is done on a `watch` channel bumped after every state change, so
//! the pool lock is only ever held for short synchronous sections.

use super::{
    Assignment, Rejected, RestartPlan, RolloutReport, WorkerId, WorkerPid, WorkerSnapshot, WorkerStatus,
    dispatcher::Dispatcher,
    record::{Slot, WorkerRecord},
    worker::{self, WorkerSpec},
};
use crate::{
    Error, PoolConfig, Result,
    control::{ControlMessage, Envelope, ExitReason},
    handler::{Connection, HandlerFactory},
};
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;

struct Pool<C> {
    slots: Vec<Slot<C>>,
    dispatcher: Dispatcher,
    /// Exits during `start` fail the launch instead of being respawned.
    starting: bool,
    shutting_down: bool,
}

impl<C> Pool<C> {
    fn slot_of_mut(&mut self, pid: WorkerPid) -> Option<&mut Slot<C>> {
        self.slots
            .iter_mut()
            .find(|slot| slot.incarnation(pid).is_some())
    }

    fn incarnations(&self) -> impl Iterator<Item = &WorkerRecord<C>> {
        self.slots
            .iter()
            .flat_map(|slot| core::iter::once(&slot.record).chain(slot.successor.as_ref()))
    }
}

struct Shared<C> {
    config: PoolConfig,
    factory: HandlerFactory,
    pool: Mutex<Pool<C>>,
    reports: mpsc::UnboundedSender<Envelope>,
    changes: watch::Sender<()>,
    degraded: watch::Sender<Vec<WorkerId>>,
    next_pid: AtomicU64,
    cancel: CancellationToken,
    rollout: tokio::sync::Mutex<()>,
}

/// Owner of a fixed-size pool of workers.
///
/// Construct one with [`Supervisor::start`]. Dropping the supervisor cancels
/// every worker and background task; call [`Supervisor::shutdown`] first for
/// a graceful drain.
pub struct Supervisor<C> {
    shared: Arc<Shared<C>>,
}

impl<C: Connection> Supervisor<C> {
    /// Spawns `config.workers` workers and waits until all of them are ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Startup`] if the pool is empty, a worker cannot be
    /// spawned, a worker exits before becoming ready, or not every worker is
    /// ready within `config.startup_timeout`. Workers already spawned are
    /// stopped before returning.
    #[tracing::instrument(skip_all, fields(workers = config.workers))]
    pub async fn start(config: PoolConfig, factory: HandlerFactory) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::startup("pool needs at least one worker"));
        }

        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pool: Mutex::new(Pool {
                slots: Vec::with_capacity(config.workers),
                dispatcher: Dispatcher::new(config.load_balance_policy),
                starting: true,
                shutting_down: false,
            }),
            config,
            factory,
            reports: reports_tx,
            changes: watch::Sender::new(()),
            degraded: watch::Sender::new(Vec::new()),
            next_pid: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            rollout: tokio::sync::Mutex::new(()),
        });
        let supervisor = Self {
            shared: Arc::clone(&shared),
        };

        tokio::spawn(pump_reports(Arc::clone(&shared), reports_rx));

        {
            let mut pool = shared.pool.lock();
            for idx in 0..shared.config.workers {
                let record = shared.spawn_incarnation(WorkerId(idx)).map_err(|e| {
                    Error::startup(format!("failed to spawn worker {idx}: {e}"))
                })?;
                pool.slots.push(Slot::new(record));
            }
        }

        let launched = timeout(
            shared.config.startup_timeout,
            shared.wait_for(|pool| {
                if let Some(dead) = pool
                    .slots
                    .iter()
                    .find(|slot| slot.record.status == WorkerStatus::Dead)
                {
                    return Some(Err(Error::startup(format!(
                        "worker {} exited before becoming ready",
                        dead.record.id
                    ))));
                }
                pool.slots
                    .iter()
                    .all(|slot| slot.record.status.is_serving())
                    .then_some(Ok(()))
            }),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::startup(format!(
                "not every worker became ready within {:?}",
                shared.config.startup_timeout
            )))
        });

        // On error `supervisor` is dropped here, which cancels every worker.
        launched?;

        shared.pool.lock().starting = false;
        tokio::spawn(monitor_heartbeats(Arc::clone(&shared)));

        tracing::info!(
            "Worker pool started with {} workers ({:?})",
            shared.config.workers,
            shared.config.load_balance_policy
        );
        Ok(supervisor)
    }

    /// Assigns a connection to a worker chosen by the load-balancing policy
    /// and hands it over.
    ///
    /// Never waits. The chosen worker's `active_connections` is incremented
    /// in the same critical section as the selection.
    ///
    /// # Errors
    ///
    /// - [`Error::NoCapacity`] if no worker is `Ready` or `Busy`.
    /// - [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown) began.
    ///
    /// A worker whose intake turns out to be closed is taken out of rotation
    /// and the connection goes to the next eligible one.
    ///
    /// The connection is dropped on error; use
    /// [`try_assign`](Self::try_assign) to get it back.
    pub fn assign(&self, conn: C) -> Result<Assignment> {
        self.try_assign(conn).map_err(|rejected| rejected.error)
    }

    /// Like [`assign`](Self::assign), but returns the connection with the
    /// error so the caller can answer it before closing.
    pub fn try_assign(&self, conn: C) -> core::result::Result<Assignment, Rejected<C>> {
        let mut pool = self.shared.pool.lock();
        if pool.shutting_down {
            return Err(Rejected::new(Error::ServiceShutdown, conn));
        }

        let Pool {
            slots, dispatcher, ..
        } = &mut *pool;
        let mut conn = conn;
        let mut closed = false;
        let assigned = loop {
            let idx = match dispatcher.select(slots.as_slice()) {
                Ok(idx) => idx,
                Err(e) => break Err(Rejected::new(e, conn)),
            };
            let record = &mut slots[idx].record;

            match record.handle.deliver(conn) {
                Ok(()) => {
                    record.connection_opened();
                    break Ok(Assignment {
                        worker: record.id,
                        pid: record.pid,
                    });
                }
                Err(returned) => {
                    // The worker loop is gone and its exit report is on the
                    // way. Stop routing to it until then.
                    tracing::debug!("Worker {} ({}) intake closed", record.id, record.pid);
                    record.status = WorkerStatus::Draining;
                    closed = true;
                    conn = returned;
                }
            }
        };

        drop(pool);
        if closed {
            self.shared.notify();
        }
        assigned
    }

    /// Replaces every worker, one at a time, without ever having more than
    /// one slot out of service.
    ///
    /// For each slot in pool order: mark it draining and stop routing to it,
    /// wait for its in-flight work to finish (bounded by `drain_timeout`,
    /// force-terminating on expiry), spawn a successor and wait for it to be
    /// ready before moving on. Concurrent calls run one after the other.
    ///
    /// # Errors
    ///
    /// - [`Error::Startup`] if a successor cannot be spawned or does not
    ///   become ready within `startup_timeout`. Slots after it are untouched.
    /// - [`Error::ServiceShutdown`] if the pool is shutting down.
    #[tracing::instrument(skip_all)]
    pub async fn rolling_restart(&self) -> Result<RolloutReport> {
        let _rollout = self.shared.rollout.lock().await;
        let started = Instant::now();

        let plan = RestartPlan::new(
            self.shared
                .pool
                .lock()
                .slots
                .iter()
                .map(|slot| slot.record.id)
                .collect::<Vec<_>>(),
        );
        tracing::info!("Rolling restart of {} workers", plan.len());

        let mut report = RolloutReport::default();
        for id in plan {
            let Some(pid) = self.shared.begin_drain(id)? else {
                tracing::info!("Skipping worker {id}");
                report.skipped.push(id);
                continue;
            };

            if !self.shared.await_drained(id, pid).await {
                let err = Error::DrainTimeoutExceeded {
                    id,
                    timeout: self.shared.config.drain_timeout,
                };
                tracing::warn!("{err}; forcing termination");
                report.drain_timeouts.push(id);
            }

            let successor = self.shared.retire_and_replace(id, pid)?;
            self.shared.await_ready(id, successor).await?;
            tracing::info!("Worker {id} replaced ({pid} -> {successor})");
            report.restarted.push(id);
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            "Rolling restart finished in {:?} ({} restarted, {} skipped, {} drain timeouts)",
            report.elapsed,
            report.restarted.len(),
            report.skipped.len(),
            report.drain_timeouts.len()
        );
        Ok(report)
    }

    /// Handles the termination of worker incarnation `pid`.
    ///
    /// Exits the supervisor asked for only mark the record dead. Any other
    /// exit marks it dead immediately, drops its connections and spawns a
    /// successor without waiting, unless the slot exceeded the crash-loop
    /// limit, in which case respawning is suspended and
    /// [`Error::PoolDegraded`] is published. Exits of unknown or already dead
    /// incarnations are ignored.
    pub fn on_worker_exit(&self, pid: WorkerPid, reason: ExitReason) {
        self.shared.on_worker_exit(pid, reason);
    }

    /// Drains every worker in parallel and stops the pool.
    ///
    /// New assignments fail with [`Error::ServiceShutdown`] from the moment
    /// this is called. Workers that do not drain within `drain_timeout` are
    /// force-terminated. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let draining = {
            let mut pool = self.shared.pool.lock();
            if pool.shutting_down {
                return Ok(());
            }
            pool.shutting_down = true;

            let mut draining = Vec::new();
            for slot in &mut pool.slots {
                for record in core::iter::once(&mut slot.record).chain(slot.successor.as_mut()) {
                    if record.status == WorkerStatus::Dead {
                        continue;
                    }
                    record.retiring = true;
                    record.status = WorkerStatus::Draining;
                    if record.handle.request_drain() {
                        draining.push((record.id, record.pid));
                    }
                }
            }
            draining
        };
        self.shared.notify();

        tracing::info!("Draining {} workers", draining.len());
        let waits = draining.iter().map(|&(id, pid)| async move {
            if !self.shared.await_drained(id, pid).await {
                let err = Error::DrainTimeoutExceeded {
                    id,
                    timeout: self.shared.config.drain_timeout,
                };
                tracing::warn!("{err}; forcing termination");
            }
        });
        futures::future::join_all(waits).await;

        {
            let mut pool = self.shared.pool.lock();
            for slot in &mut pool.slots {
                for record in core::iter::once(&mut slot.record).chain(slot.successor.as_mut()) {
                    if record.status != WorkerStatus::Dead {
                        record.handle.terminate();
                        record.status = WorkerStatus::Dead;
                        record.active_connections = 0;
                    }
                }
            }
        }
        self.shared.notify();
        self.shared.cancel.cancel();

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }

    /// Copies of every record in pool order. A slot's successor, if any, comes
    /// right after its current record.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.shared
            .pool
            .lock()
            .incarnations()
            .map(WorkerRecord::snapshot)
            .collect()
    }

    /// Number of workers currently accepting connections.
    pub fn serving_count(&self) -> usize {
        self.shared
            .pool
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.record.status.is_serving())
            .count()
    }

    /// Slots suspended by the crash-loop guard.
    pub fn degraded(&self) -> Vec<WorkerId> {
        self.shared.degraded.borrow().clone()
    }

    /// Notified every time the crash-loop guard suspends a slot.
    pub fn subscribe_degraded(&self) -> watch::Receiver<Vec<WorkerId>> {
        self.shared.degraded.subscribe()
    }

    /// `true` once every slot is suspended and nothing can serve again.
    pub fn is_exhausted(&self) -> bool {
        self.shared
            .pool
            .lock()
            .slots
            .iter()
            .all(|slot| slot.suspended && !slot.record.status.is_serving())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) fn close_intake(&self, id: WorkerId) {
        self.shared.pool.lock().slots[id.0]
            .record
            .handle
            .close_intake();
    }
}

impl<C> Drop for Supervisor<C> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<C: Connection> Shared<C> {
    fn notify(&self) {
        self.changes.send_replace(());
    }

    /// Waits until `check` returns `Some`, re-evaluating after every pool
    /// change.
    async fn wait_for<T>(&self, mut check: impl FnMut(&Pool<C>) -> Option<T>) -> T {
        let mut changes = self.changes.subscribe();
        loop {
            let found = check(&self.pool.lock());
            if let Some(found) = found {
                return found;
            }
            // The sender lives in `self`, so `changed` cannot fail here.
            let _ = changes.changed().await;
        }
    }

    fn spawn_incarnation(&self, id: WorkerId) -> io::Result<WorkerRecord<C>> {
        let pid = WorkerPid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let spec = WorkerSpec {
            id,
            pid,
            heartbeat_interval: self.config.heartbeat_interval,
            mode: self.config.handler_mode,
            factory: Arc::clone(&self.factory),
        };
        let handle = worker::spawn(spec, self.reports.clone(), &self.cancel)?;
        tracing::debug!("Spawned worker {id} ({pid})");
        Ok(WorkerRecord::new(id, pid, handle, Instant::now()))
    }

    /// Puts a fresh incarnation into `slot`, or logs and leaves the slot for
    /// the monitor to retry.
    fn respawn(&self, slot: &mut Slot<C>) {
        let id = slot.record.id;
        match self.spawn_incarnation(id) {
            Ok(record) => slot.successor = Some(record),
            Err(e) => {
                tracing::error!("Failed to respawn worker {id}: {e}; retrying on next monitor tick");
            }
        }
    }

    fn apply(&self, Envelope { pid, message }: Envelope) {
        if let ControlMessage::Exited(reason) = message {
            self.on_worker_exit(pid, reason);
            return;
        }

        let now = Instant::now();
        let mut pool = self.pool.lock();
        let Some(slot) = pool.slot_of_mut(pid) else {
            tracing::trace!("Dropping {message:?} from stale worker {pid}");
            return;
        };
        let Some(record) = slot.incarnation_mut(pid) else {
            return;
        };

        match message {
            ControlMessage::Heartbeat | ControlMessage::Ready => {
                if record.status == WorkerStatus::Dead {
                    return;
                }
                let was_starting = record.status == WorkerStatus::Starting;
                record.heartbeat(now);
                if !was_starting {
                    return;
                }
                tracing::info!("Worker {} ({pid}) is ready", record.id);
                slot.promote_if_ready();
            }
            ControlMessage::Completed => record.connection_closed(),
            ControlMessage::DrainAck => record.drain_acked = true,
            ControlMessage::DrainRequest | ControlMessage::Shutdown => {
                tracing::warn!("Worker {pid} sent a supervisor directive: {message:?}");
                return;
            }
            ControlMessage::Exited(_) => unreachable!("handled above"),
        }
        drop(pool);
        self.notify();
    }

    fn on_worker_exit(&self, pid: WorkerPid, reason: ExitReason) {
        let degraded = self.handle_exit(&mut self.pool.lock(), pid, reason, Instant::now());
        self.notify();
        if let Some(id) = degraded {
            self.publish_degraded(id);
        }
    }

    /// Applies an exit to the pool. Returns the slot id if the crash-loop
    /// guard just suspended it.
    fn handle_exit(
        &self,
        pool: &mut Pool<C>,
        pid: WorkerPid,
        reason: ExitReason,
        now: Instant,
    ) -> Option<WorkerId> {
        let (starting, shutting_down) = (pool.starting, pool.shutting_down);
        let Some(slot) = pool.slot_of_mut(pid) else {
            tracing::trace!("Exit of stale worker {pid}: {reason}");
            return None;
        };
        let record = slot.incarnation_mut(pid)?;
        if record.status == WorkerStatus::Dead {
            return None;
        }

        let id = record.id;
        let lost = record.active_connections;
        let planned = record.retiring;
        record.status = WorkerStatus::Dead;
        record.active_connections = 0;

        if planned || shutting_down {
            tracing::info!("Worker {id} ({pid}) exited: {reason}");
            return None;
        }

        tracing::warn!("Worker {id} ({pid}) exited unexpectedly: {reason} ({lost} connections lost)");
        // Covers the heartbeat case, where the thread may still be running.
        record.handle.terminate();
        if slot.successor.as_ref().is_some_and(|s| s.pid == pid) {
            slot.successor = None;
        }

        if starting {
            return None;
        }

        let window = self.config.restart_crash_window;
        let limit = self.config.restart_crash_limit;
        let exits = slot.crashes.record(now, window);
        if exits > limit {
            slot.suspended = true;
            return Some(id);
        }

        self.respawn(slot);
        None
    }

    fn publish_degraded(&self, id: WorkerId) {
        let err = Error::PoolDegraded {
            id,
            limit: self.config.restart_crash_limit,
            window: self.config.restart_crash_window,
        };
        tracing::error!("{err}");
        self.degraded.send_modify(|ids| {
            if !ids.contains(&id) {
                ids.push(id);
            }
        });
    }

    /// One monitor tick: expire silent workers and refill empty slots.
    fn check_heartbeats(&self, now: Instant) {
        let (heartbeat_timeout, startup_timeout) =
            (self.config.heartbeat_timeout, self.config.startup_timeout);
        let mut degraded = Vec::new();
        {
            let mut pool = self.pool.lock();
            if pool.shutting_down {
                return;
            }

            let overdue: Vec<_> = pool
                .incarnations()
                .filter(|record| record.is_overdue(now, heartbeat_timeout, startup_timeout))
                .map(|record| (record.id, record.pid, record.status))
                .collect();
            for (id, pid, status) in overdue {
                if status == WorkerStatus::Starting {
                    tracing::warn!(
                        "Worker {id} ({pid}) not ready within {startup_timeout:?}; replacing it"
                    );
                } else {
                    tracing::warn!(
                        "Worker {id} ({pid}) missed heartbeats for over {heartbeat_timeout:?}; replacing it"
                    );
                }
                degraded.extend(self.handle_exit(&mut pool, pid, ExitReason::Unresponsive, now));
            }

            for slot in pool.slots.iter_mut().filter(|slot| slot.needs_respawn()) {
                self.respawn(slot);
            }
        }
        self.notify();
        for id in degraded {
            self.publish_degraded(id);
        }
    }

    /// Marks the slot draining and sends `DrainRequest`. Returns the pid
    /// being drained, or `None` if the slot should be skipped.
    fn begin_drain(&self, id: WorkerId) -> Result<Option<WorkerPid>> {
        let mut pool = self.pool.lock();
        if pool.shutting_down {
            return Err(Error::ServiceShutdown);
        }
        let slot = &mut pool.slots[id.0];
        if slot.suspended || !slot.record.status.is_serving() {
            return Ok(None);
        }

        let record = &mut slot.record;
        record.status = WorkerStatus::Draining;
        record.retiring = true;
        record.drain_acked = false;
        if !record.handle.request_drain() {
            tracing::debug!("Worker {id} control channel already closed");
        }
        let pid = record.pid;
        drop(pool);
        self.notify();
        Ok(Some(pid))
    }

    /// Waits for the drain acknowledgement (or the exit) of `pid`. Returns
    /// `false` if `drain_timeout` elapsed first.
    async fn await_drained(&self, id: WorkerId, pid: WorkerPid) -> bool {
        timeout(
            self.config.drain_timeout,
            self.wait_for(|pool| match pool.slots[id.0].incarnation(pid) {
                Some(record) => {
                    (record.drain_acked || record.status == WorkerStatus::Dead).then_some(())
                }
                None => Some(()),
            }),
        )
        .await
        .is_ok()
    }

    /// Terminates `pid` and spawns its successor in one critical section, so
    /// the monitor never sees the slot empty.
    fn retire_and_replace(&self, id: WorkerId, pid: WorkerPid) -> Result<WorkerPid> {
        let mut pool = self.pool.lock();
        if pool.shutting_down {
            return Err(Error::ServiceShutdown);
        }
        let slot = &mut pool.slots[id.0];
        if let Some(record) = slot.incarnation_mut(pid) {
            if record.status != WorkerStatus::Dead {
                record.handle.terminate();
                record.status = WorkerStatus::Dead;
                record.active_connections = 0;
            }
        }

        let successor = match self.spawn_incarnation(id) {
            Ok(successor) => successor,
            Err(e) => {
                // Hand the slot back to the monitor's respawn path.
                slot.record.retiring = false;
                return Err(Error::startup(format!(
                    "failed to spawn replacement for worker {id}: {e}"
                )));
            }
        };
        let successor_pid = successor.pid;
        slot.successor = Some(successor);
        drop(pool);
        self.notify();
        Ok(successor_pid)
    }

    /// Waits until slot `id` is served by `pid` or a later incarnation.
    async fn await_ready(&self, id: WorkerId, pid: WorkerPid) -> Result<()> {
        timeout(
            self.config.startup_timeout,
            self.wait_for(|pool| {
                let slot = &pool.slots[id.0];
                if slot.record.pid >= pid && slot.record.status.is_serving() {
                    Some(Ok(()))
                } else if pool.shutting_down {
                    Some(Err(Error::ServiceShutdown))
                } else if slot.suspended {
                    Some(Err(Error::startup(format!(
                        "replacement for worker {id} crash-looped"
                    ))))
                } else {
                    None
                }
            }),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::startup(format!(
                "replacement for worker {id} not ready within {:?}",
                self.config.startup_timeout
            )))
        })
    }
}

/// Applies worker reports until the pool is cancelled.
async fn pump_reports<C: Connection>(
    shared: Arc<Shared<C>>,
    mut reports: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return,
            Some(envelope) = reports.recv() => shared.apply(envelope),
        }
    }
}

/// Heartbeat monitor. Ticks every `heartbeat_interval`.
async fn monitor_heartbeats<C: Connection>(shared: Arc<Shared<C>>) {
    let mut ticker = interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => return,
            _ = ticker.tick() => shared.check_heartbeats(Instant::now()),
        }
    }
}

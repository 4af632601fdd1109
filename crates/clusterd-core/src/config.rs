use core::time::Duration;

/// How the dispatcher picks a worker for a new connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalancePolicy {
    /// Cycle through eligible workers in pool order.
    #[default]
    RoundRobin,
    /// Pick the eligible worker with the fewest active connections, ties
    /// broken by pool order.
    LeastConnections,
}

/// Where a worker runs handler calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerMode {
    /// Run handlers on the worker runtime's blocking pool. The event loop and
    /// the heartbeat keep running while a handler computes.
    #[default]
    Offload,
    /// Run handlers directly on the worker's event loop, one connection at a
    /// time. A long handler call stalls heartbeats until it returns.
    Inline,
}

/// Runtime configuration for a [`Supervisor`](crate::pool::Supervisor).
///
/// The supervisor takes this by value at construction; there is no global
/// pool, so tests can run several independent pools side by side.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots. Fixed for the lifetime of the pool.
    pub workers: usize,
    /// How often each worker emits a heartbeat. Also the heartbeat monitor's
    /// tick.
    pub heartbeat_interval: Duration,
    /// A worker silent for longer than this is treated as crashed.
    pub heartbeat_timeout: Duration,
    /// Upper bound on waiting for a draining worker to finish in-flight work.
    pub drain_timeout: Duration,
    /// Upper bound on waiting for a freshly spawned worker to become ready.
    pub startup_timeout: Duration,
    /// Sliding window for the crash-loop guard.
    pub restart_crash_window: Duration,
    /// Unplanned exits tolerated per slot within `restart_crash_window`.
    pub restart_crash_limit: usize,
    pub load_balance_policy: LoadBalancePolicy,
    pub handler_mode: HandlerMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            heartbeat_interval: Duration::from_millis(1_000),
            heartbeat_timeout: Duration::from_millis(5_000),
            drain_timeout: Duration::from_millis(10_000),
            startup_timeout: Duration::from_millis(10_000),
            restart_crash_window: Duration::from_millis(60_000),
            restart_crash_limit: 5,
            load_balance_policy: LoadBalancePolicy::RoundRobin,
            handler_mode: HandlerMode::Offload,
        }
    }
}

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clusterd_core::{HandlerMode, LoadBalancePolicy, PoolConfig};
use core::time::Duration;
use std::path::{Path, PathBuf};

/// Command line of the `clusterd` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "clusterd",
    version,
    about = "Serve HTTP from a supervised pool of workers sharing one port"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the supervisor and serve until SIGINT or SIGTERM.
    ///
    /// SIGHUP replaces every worker, one at a time, without dropping
    /// accepted connections.
    Start(StartArgs),

    /// Ask a running instance to replace its workers (sends SIGHUP).
    Reload(ReloadArgs),
}

/// Runtime configuration for `clusterd start`.
///
/// All values are parsed from CLI arguments or environment variables, with
/// defaults suitable for production. Durations are in milliseconds.
#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Number of workers in the pool. Defaults to the number of available
    /// cores.
    ///
    /// Environment variable: `WORKERS`
    #[arg(long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// How often each worker sends a heartbeat.
    ///
    /// Environment variable: `HEARTBEAT_INTERVAL_MS`
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 1_000)]
    pub heartbeat_interval_ms: u64,

    /// A worker silent for longer than this is treated as crashed and
    /// replaced. Must be greater than the heartbeat interval.
    ///
    /// Environment variable: `HEARTBEAT_TIMEOUT_MS`
    #[arg(long, env = "HEARTBEAT_TIMEOUT_MS", default_value_t = 5_000)]
    pub heartbeat_timeout_ms: u64,

    /// How long a draining worker may keep in-flight connections before it
    /// is force-terminated.
    ///
    /// Environment variable: `DRAIN_TIMEOUT_MS`
    #[arg(long, env = "DRAIN_TIMEOUT_MS", default_value_t = 10_000)]
    pub drain_timeout_ms: u64,

    /// How long a new worker may take to become ready.
    ///
    /// Environment variable: `STARTUP_TIMEOUT_MS`
    #[arg(long, env = "STARTUP_TIMEOUT_MS", default_value_t = 10_000)]
    pub startup_timeout_ms: u64,

    /// Sliding window of the crash-loop guard.
    ///
    /// Environment variable: `RESTART_CRASH_WINDOW_MS`
    #[arg(long, env = "RESTART_CRASH_WINDOW_MS", default_value_t = 60_000)]
    pub restart_crash_window_ms: u64,

    /// Unplanned exits tolerated per worker slot within the crash window
    /// before respawning that slot is suspended.
    ///
    /// Environment variable: `RESTART_CRASH_LIMIT`
    #[arg(long, env = "RESTART_CRASH_LIMIT", default_value_t = 5)]
    pub restart_crash_limit: usize,

    /// How new connections are spread over workers.
    ///
    /// Environment variable: `LOAD_BALANCE_POLICY`
    #[arg(long, env = "LOAD_BALANCE_POLICY", value_enum, default_value_t = BalancePolicy::RoundRobin)]
    pub load_balance_policy: BalancePolicy,

    /// Where workers run request handlers. `inline` runs them on the
    /// worker's event loop, where a slow handler stalls its heartbeats.
    ///
    /// Environment variable: `HANDLER_MODE`
    #[arg(long, env = "HANDLER_MODE", value_enum, default_value_t = Mode::Offload)]
    pub handler_mode: Mode,

    /// How long a client may take to send its request before the
    /// connection is dropped.
    ///
    /// Environment variable: `READ_TIMEOUT_MS`
    #[arg(long, env = "READ_TIMEOUT_MS", default_value_t = 10_000)]
    pub read_timeout_ms: u64,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:3001"))]
    pub server_addr: String,

    /// Write the process id here while running, for `clusterd reload`.
    ///
    /// Environment variable: `PID_FILE`
    #[arg(long, env = "PID_FILE")]
    pub pid_file: Option<PathBuf>,
}

/// Which running instance `clusterd reload` signals.
#[derive(Args, Debug, Clone)]
pub struct ReloadArgs {
    /// Process id of the running instance.
    #[arg(long, conflicts_with = "pid_file")]
    pub pid: Option<i32>,

    /// Pid file written by `clusterd start`.
    ///
    /// Environment variable: `PID_FILE`
    #[arg(long, env = "PID_FILE")]
    pub pid_file: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancePolicy {
    RoundRobin,
    LeastConnections,
}

impl From<BalancePolicy> for LoadBalancePolicy {
    fn from(policy: BalancePolicy) -> Self {
        match policy {
            BalancePolicy::RoundRobin => LoadBalancePolicy::RoundRobin,
            BalancePolicy::LeastConnections => LoadBalancePolicy::LeastConnections,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Offload,
    Inline,
}

impl From<Mode> for HandlerMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Offload => HandlerMode::Offload,
            Mode::Inline => HandlerMode::Inline,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub pool: PoolConfig,
    pub read_timeout: Duration,
    pub server_addr: String,
    pub pid_file: Option<PathBuf>,
}

impl TryFrom<StartArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: StartArgs) -> Result<Self, Self::Error> {
        let workers = args.workers.unwrap_or_else(num_cpus::get);
        if workers == 0 {
            bail!("WORKERS must be greater than 0");
        }

        for (name, value) in [
            ("HEARTBEAT_INTERVAL_MS", args.heartbeat_interval_ms),
            ("DRAIN_TIMEOUT_MS", args.drain_timeout_ms),
            ("STARTUP_TIMEOUT_MS", args.startup_timeout_ms),
            ("RESTART_CRASH_WINDOW_MS", args.restart_crash_window_ms),
            ("READ_TIMEOUT_MS", args.read_timeout_ms),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }

        if args.heartbeat_timeout_ms <= args.heartbeat_interval_ms {
            bail!(
                "HEARTBEAT_TIMEOUT_MS ({}) must be greater than HEARTBEAT_INTERVAL_MS ({})",
                args.heartbeat_timeout_ms,
                args.heartbeat_interval_ms
            );
        }

        Ok(Self {
            pool: PoolConfig {
                workers,
                heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
                heartbeat_timeout: Duration::from_millis(args.heartbeat_timeout_ms),
                drain_timeout: Duration::from_millis(args.drain_timeout_ms),
                startup_timeout: Duration::from_millis(args.startup_timeout_ms),
                restart_crash_window: Duration::from_millis(args.restart_crash_window_ms),
                restart_crash_limit: args.restart_crash_limit,
                load_balance_policy: args.load_balance_policy.into(),
                handler_mode: args.handler_mode.into(),
            },
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            server_addr: args.server_addr,
            pid_file: args.pid_file,
        })
    }
}

impl ReloadArgs {
    /// Resolves the process id to signal.
    pub fn target(&self) -> anyhow::Result<i32> {
        match (self.pid, self.pid_file.as_deref()) {
            (Some(pid), _) => Ok(pid),
            (None, Some(path)) => read_pid_file(path),
            (None, None) => bail!("either --pid or --pid-file (PID_FILE) is required"),
        }
    }
}

pub fn read_pid_file(path: &Path) -> anyhow::Result<i32> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pid file {}", path.display()))?;
    let pid = raw
        .trim()
        .parse::<i32>()
        .with_context(|| format!("pid file {} does not hold a process id", path.display()))?;
    if pid <= 0 {
        bail!("pid file {} holds invalid process id {pid}", path.display());
    }
    Ok(pid)
}

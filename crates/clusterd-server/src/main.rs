#![doc = include_str!("../README.md")]

mod server;

use anyhow::{Context, bail};
use clap::Parser;
use clusterd_core::{Error, Supervisor};
use server::config::{Cli, Command, ReloadArgs, ServerConfig, StartArgs};
use server::pidfile::PidFile;
use server::signals::{ControlSignal, SignalListener, send_reload};
use server::telemetry::{self, init_telemetry};
use server::transport::{HttpConnection, accept_loop};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type Pool = Supervisor<HttpConnection>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let providers = init_telemetry()?;
    let result = match cli.command {
        Command::Start(args) => start(args).await,
        Command::Reload(args) => reload(&args),
    };
    providers.shutdown();
    result
}

fn reload(args: &ReloadArgs) -> anyhow::Result<()> {
    send_reload(args.target()?)
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let config = ServerConfig::try_from(args)?;

    let listener = TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;
    log_startup_info(&listener.local_addr()?, &config);

    // Installed before the pid file exists, so an early `reload` cannot kill
    // the process with the default SIGHUP action.
    let mut signals = SignalListener::install()?;
    let _pid_file = config.pid_file.as_deref().map(PidFile::create).transpose()?;

    let supervisor = Arc::new(Supervisor::start(config.pool.clone(), server::app::factory()).await?);

    let cancel = CancellationToken::new();
    let accept = tokio::spawn(accept_loop(
        listener,
        Arc::clone(&supervisor),
        config.read_timeout,
        cancel.clone(),
    ));
    tracing::info!("App listening on {}", config.server_addr);

    let outcome = serve(&supervisor, &mut signals).await;

    // 1. Stop accepting
    cancel.cancel();
    if let Err(e) = accept.await {
        tracing::error!("Accept loop failed: {e}");
    }

    // 2. Drain the pool
    supervisor.shutdown().await?;
    outcome?;

    let degraded = supervisor.degraded();
    if !degraded.is_empty() {
        let ids: Vec<_> = degraded.iter().map(ToString::to_string).collect();
        bail!(
            "Pool ran degraded: respawning was suspended for workers [{}]",
            ids.join(", ")
        );
    }

    tracing::info!("Service shut down successfully");
    Ok(())
}

/// Runs until a shutdown signal arrives or every worker slot is suspended.
async fn serve(supervisor: &Arc<Pool>, signals: &mut SignalListener) -> anyhow::Result<()> {
    let mut degraded = supervisor.subscribe_degraded();

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                ControlSignal::Reload => {
                    tracing::info!("Received {signal}, replacing workers");
                    telemetry::increment_reloads();
                    spawn_rollout(Arc::clone(supervisor));
                }
                ControlSignal::Shutdown(_) => {
                    tracing::info!("Received {signal}, terminating gracefully...");
                    return Ok(());
                }
            },
            changed = degraded.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                if supervisor.is_exhausted() {
                    bail!("Every worker slot is suspended; nothing left to serve");
                }
            }
        }
    }
}

/// Rolling restarts run in the background so signals keep being handled.
/// Overlapping requests queue up inside the supervisor.
fn spawn_rollout(supervisor: Arc<Pool>) {
    tokio::spawn(async move {
        match supervisor.rolling_restart().await {
            Ok(report) => {
                telemetry::record_rollout_duration(report.elapsed.as_secs_f64() * 1_000.0);
                if !report.drain_timeouts.is_empty() {
                    tracing::warn!(
                        "{} workers were force-terminated during the rollout",
                        report.drain_timeouts.len()
                    );
                }
            }
            Err(Error::ServiceShutdown) => {
                tracing::debug!("Rolling restart interrupted by shutdown");
            }
            Err(e) => tracing::error!("Rolling restart failed: {e}"),
        }
    });
}

fn log_startup_info(addr: &SocketAddr, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting clusterd on {} with full config: {:#?}", addr, config);
    } else {
        tracing::info!(
            "Starting clusterd on {} with {} workers ({:?}, {:?})",
            addr,
            config.pool.workers,
            config.pool.load_balance_policy,
            config.pool.handler_mode
        );
    }
}

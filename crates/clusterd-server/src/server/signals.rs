//! Process signals.
//!
//! - **SIGINT**, **SIGTERM**, **SIGQUIT**: graceful shutdown.
//! - **SIGHUP**: rolling restart of the worker pool.
//!
//! On non-Unix platforms only Ctrl+C is handled and `reload` is unavailable.

use core::fmt;

/// What a received signal asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Shutdown(&'static str),
    Reload,
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSignal::Shutdown(name) => write!(f, "{name} (shutdown)"),
            ControlSignal::Reload => write!(f, "SIGHUP (reload)"),
        }
    }
}

/// Signal handlers installed once at startup, so a signal arriving between
/// two `recv` calls is not lost.
#[cfg(unix)]
pub struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    pub async fn recv(&mut self) -> ControlSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ControlSignal::Shutdown("SIGINT"),
            _ = self.terminate.recv() => ControlSignal::Shutdown("SIGTERM"),
            _ = self.quit.recv() => ControlSignal::Shutdown("SIGQUIT"),
            _ = self.hangup.recv() => ControlSignal::Reload,
        }
    }
}

#[cfg(not(unix))]
pub struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> ControlSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
        }
        ControlSignal::Shutdown("Ctrl+C")
    }
}

/// Sends SIGHUP to `pid`, asking that instance for a rolling restart.
#[cfg(unix)]
pub fn send_reload(pid: i32) -> anyhow::Result<()> {
    use anyhow::Context;
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    kill(Pid::from_raw(pid), Signal::SIGHUP)
        .with_context(|| format!("failed to send SIGHUP to process {pid}"))?;
    tracing::info!("Sent SIGHUP to process {pid}");
    Ok(())
}

#[cfg(not(unix))]
pub fn send_reload(_pid: i32) -> anyhow::Result<()> {
    anyhow::bail!("reload is only supported on Unix platforms");
}

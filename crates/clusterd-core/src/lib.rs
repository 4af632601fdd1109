//! A supervised pool of workers that share one listening endpoint.
//!
//! A [`Supervisor`] spawns a fixed number of workers, each on its own thread
//! with its own event loop, hands accepted connections to them through a
//! [`Dispatcher`], watches their heartbeats, replaces the ones that crash or
//! go silent and can replace all of them one at a time without dropping
//! accepted connections.
//!
//! ```no_run
//! use clusterd_core::{PoolConfig, Request, Response, HandlerError, Supervisor, handler_factory};
//! # async fn run<C: clusterd_core::Connection>(conn: C) -> clusterd_core::Result<()> {
//! let factory = handler_factory(|| {
//!     Ok(|_: &Request| -> Result<Response, HandlerError> { Ok(Response::ok("Hello World!")) })
//! });
//! let supervisor = Supervisor::start(PoolConfig { workers: 4, ..Default::default() }, factory).await?;
//! supervisor.assign(conn)?;
//! supervisor.rolling_restart().await?;
//! supervisor.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
pub mod control;
mod error;
pub mod handler;
pub mod pool;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::handler::{
    Connection, Handler, HandlerError, HandlerFactory, Request, Response, SharedHandler,
    handler_factory,
};
pub use crate::pool::{
    Assignment, Dispatcher, Rejected, RolloutReport, Supervisor, WorkerId, WorkerPid, WorkerSnapshot,
    WorkerStatus,
};

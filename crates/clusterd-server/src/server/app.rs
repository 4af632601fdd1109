//! The demo application served by every worker.
//!
//! - `GET /` answers `Hello World!`.
//! - `GET /api/slow` runs a CPU-bound loop. In inline mode it holds back the
//!   worker's heartbeats for as long as it runs, which only trips the
//!   monitor when the heartbeat timeout is shorter than the call.

use clusterd_core::{Handler, HandlerError, HandlerFactory, Request, Response, handler_factory};
use std::{thread, time::Instant};

/// Upper bound of the `/api/slow` loop: 7^7.
pub const SLOW_ITERATIONS: u32 = 823_543;

#[derive(Debug, Default, Clone, Copy)]
pub struct App;

impl Handler for App {
    fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/") => Ok(Response::ok("Hello World!")),
            ("GET", "/api/slow") => {
                let started = Instant::now();
                let result = slow_sum(SLOW_ITERATIONS);
                tracing::info!(
                    "slowApi: {:?} (served by {})",
                    started.elapsed(),
                    thread::current().name().unwrap_or("unnamed thread")
                );
                Ok(Response::ok(format!("Result number is {result}")))
            }
            _ => Err(HandlerError::not_found(&request.path)),
        }
    }
}

/// `sum(atan(i) * tan(i))` for `i` from `from` down to 0.
pub fn slow_sum(from: u32) -> f64 {
    (0..=from)
        .rev()
        .map(|i| {
            let x = f64::from(i);
            x.atan() * x.tan()
        })
        .sum()
}

pub fn factory() -> HandlerFactory {
    handler_factory(|| Ok(App))
}

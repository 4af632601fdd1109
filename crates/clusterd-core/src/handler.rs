//! Application-facing contracts: requests, responses, handlers and the
//! connection abstraction workers read from and write to.
//!
//! Handlers are plain synchronous functions. They never see the pool, the
//! dispatcher or the control channel; concurrency and restarts are the
//! supervisor's business.

use bytes::Bytes;
use core::future::Future;
use std::{io, sync::Arc};

/// A single request read off an assigned connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: Bytes,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            body: Bytes::new(),
        }
    }
}

/// A response written back to the client by the worker that served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 503 sent by the transport when no worker can take the connection.
    pub fn unavailable() -> Self {
        Self::with_status(503, "Service Unavailable")
    }
}

/// Failure returned by a [`Handler`], turned into an error [`Response`] at the
/// worker boundary.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("Handler error ({status}): {message}")]
pub struct HandlerError {
    pub status: u16,
    pub message: String,
}

impl HandlerError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(404, format!("Cannot find {path}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

impl From<HandlerError> for Response {
    fn from(err: HandlerError) -> Self {
        Self::with_status(err.status, err.message)
    }
}

/// The application callback: one request in, one response (or error) out.
///
/// Implemented for every `Fn(&Request) -> Result<Response, HandlerError>`
/// closure that is `Send + Sync`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        self(request)
    }
}

pub type SharedHandler = Arc<dyn Handler>;

/// Builds one handler per worker incarnation.
///
/// Called on the worker's own thread during initialisation. An error here is
/// reported as a crash of that worker.
pub type HandlerFactory = Arc<dyn Fn() -> Result<SharedHandler, HandlerError> + Send + Sync>;

/// Wraps a closure returning handlers into a [`HandlerFactory`].
pub fn handler_factory<F, H>(make: F) -> HandlerFactory
where
    F: Fn() -> Result<H, HandlerError> + Send + Sync + 'static,
    H: Handler,
{
    Arc::new(move || make().map(|handler| Arc::new(handler) as SharedHandler))
}

/// An accepted client connection as seen by a worker.
///
/// The transport owns the wire format; workers only read one request and
/// write one response.
pub trait Connection: Send + 'static {
    fn read_request(&mut self) -> impl Future<Output = io::Result<Request>> + Send;

    fn write_response(&mut self, response: Response) -> impl Future<Output = io::Result<()>> + Send;
}

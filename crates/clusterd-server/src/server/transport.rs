//! TCP front end.
//!
//! The accept loop owns the listening socket. Every accepted stream is
//! detached from the accepting runtime and handed to a worker through
//! [`Supervisor::try_assign`]; the worker re-registers it with its own event
//! loop on first use. Connections nobody can take are answered with `503`
//! and closed.
//!
//! Framing is a minimal HTTP/1.1 subset: one request per connection
//! (request line, headers, optional `Content-Length` body) and a response
//! sent with `Connection: close`. A client that does not deliver its request
//! within the read timeout is dropped.

use crate::server::telemetry;
use bytes::BytesMut;
use clusterd_core::{Connection, Rejected, Request, Response, Supervisor};
use core::time::Duration;
use std::{io, mem, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

enum Stream {
    /// Not yet bound to any event loop.
    Detached(std::net::TcpStream),
    Attached(TcpStream),
    Closed,
}

/// An accepted client connection.
pub struct HttpConnection {
    stream: Stream,
    peer: SocketAddr,
    read_timeout: Duration,
}

impl HttpConnection {
    /// Unbinds an accepted stream from the accepting runtime so a worker's
    /// event loop can own it.
    pub fn detach(stream: TcpStream, peer: SocketAddr, read_timeout: Duration) -> io::Result<Self> {
        Ok(Self {
            stream: Stream::Detached(stream.into_std()?),
            peer,
            read_timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Registers the stream with the current runtime on first use.
    fn attach(&mut self) -> io::Result<&mut TcpStream> {
        self.stream = match mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Detached(stream) => Stream::Attached(TcpStream::from_std(stream)?),
            other => other,
        };
        match &mut self.stream {
            Stream::Attached(stream) => Ok(stream),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )),
        }
    }

    /// Answers a connection that could not be assigned and closes it.
    pub async fn reject(mut self, response: Response) {
        if let Err(e) = self.write_response(response).await {
            tracing::debug!("Failed to answer rejected connection from {}: {e}", self.peer);
        }
    }
}

impl Connection for HttpConnection {
    async fn read_request(&mut self) -> io::Result<Request> {
        let read_timeout = self.read_timeout;
        let stream = self.attach()?;
        tokio::time::timeout(read_timeout, read_request_from(stream))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no complete request within {read_timeout:?}"),
                )
            })?
    }

    async fn write_response(&mut self, response: Response) -> io::Result<()> {
        let stream = self.attach()?;
        stream.write_all(&encode_response(&response)).await?;
        stream.shutdown().await
    }
}

async fn read_request_from(stream: &mut TcpStream) -> io::Result<Request> {
    let mut buf = BytesMut::with_capacity(1024);
    let head = loop {
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(invalid("request head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the request head",
            ));
        }
    };

    if head.content_length > MAX_BODY_BYTES {
        return Err(invalid("request body too large"));
    }
    let mut body = buf.split_off(head.len);
    while body.len() < head.content_length {
        if stream.read_buf(&mut body).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside the request body",
            ));
        }
    }
    body.truncate(head.content_length);

    Ok(Request {
        method: head.method,
        path: head.path,
        body: body.freeze(),
    })
}

#[derive(Debug, PartialEq, Eq)]
struct Head {
    method: String,
    path: String,
    content_length: usize,
    /// Bytes up to and including the blank line.
    len: usize,
}

fn invalid(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Parses the request head once the blank line has arrived. `Ok(None)`
/// means more bytes are needed.
fn parse_head(buf: &[u8]) -> io::Result<Option<Head>> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..end]).map_err(|_| invalid("request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");

    let mut request_line = lines.next().unwrap_or_default().split(' ');
    let (Some(method), Some(target), Some(version)) =
        (request_line.next(), request_line.next(), request_line.next())
    else {
        return Err(invalid("malformed request line"));
    };
    if method.is_empty() || !target.starts_with('/') || !version.starts_with("HTTP/1.") {
        return Err(invalid("malformed request line"));
    }

    let mut content_length = 0;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(invalid("malformed header"));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| invalid("invalid Content-Length"))?;
        }
    }

    let path = target.split('?').next().unwrap_or(target);
    Ok(Some(Head {
        method: method.to_string(),
        path: path.to_string(),
        content_length,
        len: end + 4,
    }))
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn encode_response(response: &Response) -> BytesMut {
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        response.status,
        reason_phrase(response.status),
        response.body.len()
    );
    let mut out = BytesMut::with_capacity(head.len() + response.body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&response.body);
    out
}

/// Accepts connections until `cancel` fires and hands each one to the pool.
pub async fn accept_loop(
    listener: TcpListener,
    supervisor: Arc<Supervisor<HttpConnection>>,
    read_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {e}");
                    continue;
                }
            },
        };

        let conn = match HttpConnection::detach(stream, peer, read_timeout) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Failed to detach connection from {peer}: {e}");
                continue;
            }
        };

        match supervisor.try_assign(conn) {
            Ok(assignment) => {
                telemetry::increment_connections_accepted();
                tracing::trace!(
                    "Assigned {peer} to worker {} ({})",
                    assignment.worker,
                    assignment.pid
                );
            }
            Err(Rejected { error, connection }) => {
                telemetry::increment_connections_rejected();
                tracing::warn!("Rejecting {}: {error}", connection.peer());
                tokio::spawn(connection.reject(Response::unavailable()));
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::app;
    use clusterd_core::PoolConfig;
    use tokio::time::timeout;

    #[test]
    fn parses_complete_head() {
        let raw = b"GET /api/slow?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(
            head,
            Head {
                method: "GET".to_string(),
                path: "/api/slow".to_string(),
                content_length: 0,
                len: raw.len(),
            }
        );
    }

    #[test]
    fn waits_for_blank_line() {
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap(), None);
        assert_eq!(parse_head(b"").unwrap(), None);
    }

    #[test]
    fn reads_content_length() {
        let raw = b"POST /submit HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.content_length, 5);
        assert_eq!(&raw[head.len..], b"hello");
    }

    #[test]
    fn rejects_malformed_heads() {
        for raw in [
            "GARBAGE\r\n\r\n",
            "GET nopath HTTP/1.1\r\n\r\n",
            "GET / SPDY/3\r\n\r\n",
            "GET / HTTP/1.1\r\nno-colon\r\n\r\n",
            "GET / HTTP/1.1\r\nContent-Length: lots\r\n\r\n",
        ] {
            let err = parse_head(raw.as_bytes()).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn encodes_close_delimited_response() {
        let encoded = encode_response(&Response::unavailable());
        assert_eq!(
            &encoded[..],
            &b"HTTP/1.1 503 Service Unavailable\r\n\
               Content-Type: text/plain; charset=utf-8\r\n\
               Content-Length: 19\r\n\
               Connection: close\r\n\
               \r\n\
               Service Unavailable"[..]
        );
    }

    async fn fetch(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_through_the_pool_and_rejects_after_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = PoolConfig {
            workers: 2,
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(500),
            ..PoolConfig::default()
        };
        let supervisor = Arc::new(Supervisor::start(config, app::factory()).await.unwrap());
        let cancel = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&supervisor),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        let ok = fetch(addr, "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"), "{ok}");
        assert!(ok.ends_with("\r\n\r\nHello World!"), "{ok}");

        let missing = fetch(addr, "GET /missing HTTP/1.1\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"), "{missing}");

        supervisor.shutdown().await.unwrap();
        let rejected = fetch(addr, "GET / HTTP/1.1\r\n\r\n").await;
        assert!(
            rejected.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
            "{rejected}"
        );

        cancel.cancel();
        accept.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_clients_are_dropped_after_the_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = PoolConfig {
            workers: 1,
            handler_mode: clusterd_core::HandlerMode::Inline,
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(500),
            ..PoolConfig::default()
        };
        let supervisor = Arc::new(Supervisor::start(config, app::factory()).await.unwrap());
        let cancel = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&supervisor),
            Duration::from_millis(200),
            cancel.clone(),
        ));

        // Connects and sends nothing.
        let mut silent = TcpStream::connect(addr).await.unwrap();

        // The same worker still answers others while the silent client waits.
        let ok = fetch(addr, "GET / HTTP/1.1\r\n\r\n").await;
        assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"), "{ok}");

        let mut leftover = String::new();
        timeout(Duration::from_secs(2), silent.read_to_string(&mut leftover))
            .await
            .unwrap()
            .unwrap();
        assert!(leftover.is_empty(), "{leftover}");

        cancel.cancel();
        accept.await.unwrap();
        supervisor.shutdown().await.unwrap();
    }
}

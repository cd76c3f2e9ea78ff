//! Protocol demultiplexer
//!
//! Peeks at the first bytes of each accepted connection and hands it to the
//! gRPC or HTTP/1 accept queue. Peeking consumes nothing, so the chosen
//! server sees the connection from its first byte.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{ActiveConnections, LimitedStream};
use crate::metrics::record_connection;

/// HTTP/2 client connection preface (RFC 9113 §3.4)
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Request-line prefixes of HTTP/1.x methods
const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// How long a new connection may stay silent before it is dropped
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Grpc,
    Http1,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::Http1 => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Matched(Protocol),
    /// Bytes so far are a prefix of a known protocol
    NeedMore,
    Unknown,
}

/// Classify a connection by its leading bytes
pub fn classify(buf: &[u8]) -> Classification {
    if buf.is_empty() {
        return Classification::NeedMore;
    }

    let mut partial = false;

    let n = buf.len().min(HTTP2_PREFACE.len());
    if buf[..n] == HTTP2_PREFACE[..n] {
        if n == HTTP2_PREFACE.len() {
            return Classification::Matched(Protocol::Grpc);
        }
        partial = true;
    }

    for method in HTTP1_METHODS {
        let n = buf.len().min(method.len());
        if buf[..n] == method[..n] {
            if n == method.len() {
                return Classification::Matched(Protocol::Http1);
            }
            partial = true;
        }
    }

    if partial {
        Classification::NeedMore
    } else {
        Classification::Unknown
    }
}

/// Peek until the protocol is known, the peer goes quiet, or it closes
async fn sniff(stream: &TcpStream, timeout: Duration) -> io::Result<Option<Protocol>> {
    let mut buf = [0u8; 24];

    let detect = async {
        loop {
            let n = stream.peek(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            match classify(&buf[..n]) {
                Classification::Matched(protocol) => return Ok(Some(protocol)),
                Classification::Unknown => return Ok(None),
                Classification::NeedMore if n == buf.len() => return Ok(None),
                // peek returns immediately with what is buffered
                Classification::NeedMore => tokio::time::sleep(Duration::from_millis(2)).await,
            }
        }
    };

    match tokio::time::timeout(timeout, detect).await {
        Ok(result) => result,
        Err(_) => Ok(None),
    }
}

/// Accept queues fed by the demux
pub struct Queues {
    pub grpc: mpsc::Sender<io::Result<LimitedStream>>,
    pub http: mpsc::Sender<LimitedStream>,
}

impl Queues {
    async fn closed(&self) {
        self.grpc.closed().await;
        self.http.closed().await;
    }
}

/// Accept loop
///
/// Exits when `stop` is cancelled or both servers dropped their queues.
pub async fn run(
    listener: TcpListener,
    max_connections: usize,
    queues: Queues,
    stop: CancellationToken,
    sniff_timeout: Duration,
) {
    let limiter = Arc::new(Semaphore::new(max_connections));
    let active = ActiveConnections::default();
    let queues = Arc::new(queues);

    loop {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = queues.closed() => break,
            permit = limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, remote) = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = queues.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let queues = queues.clone();
        let active = active.clone();
        tokio::spawn(async move {
            let protocol = match sniff(&stream, sniff_timeout).await {
                Ok(Some(protocol)) => protocol,
                Ok(None) => {
                    record_connection("unknown");
                    debug!(remote = %remote, "Closing connection with unrecognized protocol");
                    return;
                }
                Err(e) => {
                    debug!(remote = %remote, error = %e, "Connection failed during detection");
                    return;
                }
            };

            record_connection(protocol.as_str());
            let stream = LimitedStream::new(stream, permit, active);
            let delivered = match protocol {
                Protocol::Grpc => queues.grpc.send(Ok(stream)).await.is_ok(),
                Protocol::Http1 => queues.http.send(stream).await.is_ok(),
            };
            if !delivered {
                debug!(
                    remote = %remote,
                    protocol = protocol.as_str(),
                    "Server stopped, dropping connection"
                );
            }
        });
    }

    info!("Connection demux stopped");
}

/// Remote address for logs when the socket no longer knows it
pub fn describe_peer(stream: &LimitedStream) -> String {
    stream
        .peer_addr()
        .map(|a: SocketAddr| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

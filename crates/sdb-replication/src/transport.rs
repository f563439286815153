//! Transport abstraction for shipping entries to a follower.
//!
//! The shipper needs an answer before it may advance its watermark, so the
//! client side of the protocol is a blocking request/response call - unlike
//! a fire-and-forget consensus transport, there is nothing useful to do
//! while a batch is in flight to the same follower.
//!
//! Implementations:
//!
//! - [`TcpReplicaClient`]: framed messages over a blocking TCP connection,
//!   reconnecting lazily after failures
//! - [`LocalReplicaClient`]: calls a follower in the same process; used by
//!   tests and single-process deployments

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::framing::{FrameDecoder, FrameEncoder, FramingError};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, WireMessage};

/// Errors that can occur while talking to a follower.
///
/// All of these are recoverable from the shipper's point of view: it
/// retries with backoff without advancing its watermark.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection or read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream carried an invalid frame.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The peer answered with something other than a response.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// The peer closed the connection mid-exchange.
    #[error("peer disconnected")]
    Disconnected,

    /// The endpoint string could not be resolved to an address.
    #[error("cannot resolve endpoint: {endpoint}")]
    BadEndpoint { endpoint: String },
}

// ============================================================================
// Client trait
// ============================================================================

/// One follower's RPC stub.
///
/// Implementations must be safe to call from the owning shipper thread and
/// must not retry internally - retry policy belongs to the shipper.
pub trait ReplicaClient: Send + Sync {
    /// Ships a batch and blocks for the follower's answer.
    fn append_entries(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    /// The endpoint this client talks to (for logging and registry keys).
    fn endpoint(&self) -> &str;
}

// ============================================================================
// Service trait (follower side)
// ============================================================================

/// The follower-side handler a server dispatches requests to.
///
/// `LogReplicator` in the follower role implements this; so can any test
/// double.
pub trait AppendEntriesService: Send + Sync {
    /// Handles one batch: validate, store durably, apply, acknowledge.
    fn append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse;
}

// ============================================================================
// In-process client
// ============================================================================

/// A client that calls a follower living in the same process.
///
/// No sockets, no frames - the request is handed straight to the service.
/// This is the deterministic transport the protocol tests run on.
pub struct LocalReplicaClient {
    endpoint: String,
    service: Arc<dyn AppendEntriesService>,
}

impl LocalReplicaClient {
    /// Creates a client wired directly to `service`.
    pub fn new(endpoint: impl Into<String>, service: Arc<dyn AppendEntriesService>) -> Self {
        Self {
            endpoint: endpoint.into(),
            service,
        }
    }
}

impl ReplicaClient for LocalReplicaClient {
    fn append_entries(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        Ok(self.service.append_entries(request))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for LocalReplicaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalReplicaClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// ============================================================================
// TCP client
// ============================================================================

/// Framed request/response client over blocking TCP.
///
/// The connection is established lazily on first use and dropped on any
/// error; the next call reconnects. One request is in flight at a time
/// (the connection is mutex-guarded), which matches the shipper's strictly
/// ordered send discipline.
#[derive(Debug)]
pub struct TcpReplicaClient {
    endpoint: String,
    timeout: Duration,
    encoder: FrameEncoder,
    conn: Mutex<Option<TcpStream>>,
}

impl TcpReplicaClient {
    /// Creates a client for `endpoint` (e.g. `"127.0.0.1:18527"`).
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            encoder: FrameEncoder::new(),
            conn: Mutex::new(None),
        }
    }

    fn resolve(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::BadEndpoint {
                endpoint: self.endpoint.clone(),
            })
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint, "connected to follower");
        Ok(stream)
    }

    /// One framed round trip on an established stream.
    fn exchange(
        &self,
        stream: &mut TcpStream,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let frame = self
            .encoder
            .encode(&WireMessage::AppendEntriesRequest(request.clone()))?;
        stream.write_all(&frame)?;

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(TransportError::Disconnected);
            }
            decoder.extend(&buf[..n]);
            if let Some(message) = decoder.decode::<WireMessage>()? {
                return match message {
                    WireMessage::AppendEntriesResponse(response) => Ok(response),
                    other => Err(TransportError::UnexpectedMessage(other.name())),
                };
            }
        }
    }
}

impl ReplicaClient for TcpReplicaClient {
    fn append_entries(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let mut conn = self.conn.lock().expect("client connection lock poisoned");

        if conn.is_none() {
            *conn = Some(self.connect()?);
        }
        let stream = conn.as_mut().expect("connection exists: just established");

        match self.exchange(stream, request) {
            Ok(response) => Ok(response),
            Err(e) => {
                // Drop the stream; the next call reconnects from scratch.
                warn!(endpoint = %self.endpoint, error = %e, "request failed, disconnecting");
                *conn = None;
                Err(e)
            }
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

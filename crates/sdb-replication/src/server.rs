//! Non-blocking RPC server for the follower side.
//!
//! A [`ReplicaServer`] accepts connections from leaders, decodes framed
//! [`AppendEntriesRequest`](crate::AppendEntriesRequest)s, dispatches them
//! to an [`AppendEntriesService`], and writes the framed responses back on
//! the same connection.
//!
//! # Design
//!
//! - mio poll loop on one dedicated thread; connections never get their
//!   own threads
//! - requests on one connection are handled in arrival order, which
//!   preserves the leader's strictly ordered send discipline
//! - a poll timeout bounds how long shutdown takes to be observed

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::framing::{FrameDecoder, FrameEncoder};
use crate::message::WireMessage;
use crate::transport::AppendEntriesService;

/// Token for the listener socket.
const LISTENER_TOKEN: Token = Token(0);

/// First token handed to an accepted connection.
const FIRST_CONN_TOKEN: usize = 1;

/// Read buffer size for socket reads.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Maximum number of events to process per poll iteration.
const MAX_EVENTS: usize = 128;

/// Poll timeout; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Connection state
// ============================================================================

/// One accepted leader connection.
struct Connection {
    stream: TcpStream,
    decoder: FrameDecoder,
    write_buffer: Vec<u8>,
    open: bool,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            write_buffer: Vec::new(),
            open: true,
        }
    }

    /// Attempts to drain the write buffer.
    fn flush(&mut self) {
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => {
                    self.open = false;
                    return;
                }
                Ok(n) => {
                    self.write_buffer.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "write error, closing connection");
                    self.open = false;
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Replica Server
// ============================================================================

/// Accepts leader connections and serves `AppendEntries` for a follower.
///
/// The poll loop runs on its own thread from `bind` until `shutdown` (or
/// drop). Binding to port 0 picks a free port; use
/// [`local_addr`](Self::local_addr) to learn it.
pub struct ReplicaServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReplicaServer {
    /// Binds `addr` and starts serving `service` on a background thread.
    pub fn bind(addr: SocketAddr, service: Arc<dyn AppendEntriesService>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        debug!(addr = %local_addr, "replica server listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = ServerWorker {
            poll,
            listener,
            service,
            shutdown: Arc::clone(&shutdown),
            connections: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            encoder: FrameEncoder::new(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("replica-server-{local_addr}"))
            .spawn(move || worker.run())?;

        Ok(Self {
            local_addr,
            shutdown,
            handle: Some(handle),
        })
    }

    /// The address the server is actually listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the poll loop and joins its thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(addr = %self.local_addr, "server thread panicked");
            }
        }
    }
}

impl Drop for ReplicaServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReplicaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

// ============================================================================
// Server worker
// ============================================================================

/// The state moved onto the server thread.
struct ServerWorker {
    poll: Poll,
    listener: TcpListener,
    service: Arc<dyn AppendEntriesService>,
    shutdown: Arc<AtomicBool>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    encoder: FrameEncoder,
}

impl ServerWorker {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while !self.shutdown.load(Ordering::Acquire) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "poll failed, server exiting");
                    return;
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    token => {
                        if let Some(conn) = self.connections.get_mut(&token) {
                            if event.is_readable() {
                                Self::handle_readable(conn, &self.service, &self.encoder);
                            }
                            if event.is_writable() {
                                conn.flush();
                            }
                        }
                    }
                }
            }

            // Sweep: drain any writes left behind, drop closed connections.
            for conn in self.connections.values_mut() {
                if conn.open && !conn.write_buffer.is_empty() {
                    conn.flush();
                }
            }
            self.connections.retain(|_, conn| conn.open);
        }
        debug!("replica server shut down");
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    debug!(addr = %addr, "accepted leader connection");
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(addr = %addr, error = %e, "failed to register connection");
                        continue;
                    }
                    self.connections.insert(token, Connection::new(stream));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Reads what the socket has, dispatches complete requests, and queues
    /// their responses.
    fn handle_readable(
        conn: &mut Connection,
        service: &Arc<dyn AppendEntriesService>,
        encoder: &FrameEncoder,
    ) {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    conn.open = false;
                    break;
                }
                Ok(n) => {
                    conn.decoder.extend(&buf[..n]);
                    Self::dispatch_buffered(conn, service, encoder);
                    if !conn.open {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "read error, closing connection");
                    conn.open = false;
                    break;
                }
            }
        }

        conn.flush();
    }

    fn dispatch_buffered(
        conn: &mut Connection,
        service: &Arc<dyn AppendEntriesService>,
        encoder: &FrameEncoder,
    ) {
        loop {
            match conn.decoder.decode::<WireMessage>() {
                Ok(Some(WireMessage::AppendEntriesRequest(request))) => {
                    let response = service.append_entries(&request);
                    match encoder.encode(&WireMessage::AppendEntriesResponse(response)) {
                        Ok(frame) => conn.write_buffer.extend(frame),
                        Err(e) => {
                            warn!(error = %e, "failed to encode response");
                            conn.open = false;
                            return;
                        }
                    }
                }
                Ok(Some(other)) => {
                    warn!(message = other.name(), "unexpected message from leader");
                    conn.open = false;
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "decode error");
                    if e.is_fatal() {
                        conn.open = false;
                    }
                    return;
                }
            }
        }
    }
}

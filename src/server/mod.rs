//! # Server Module
//!
//! Minimal HTTP/1.1 transport for the API: one coroutine per connection,
//! request heads parsed with `httparse`, bodies decoded lazily, responses
//! written by a per-connection writer coroutine.
//!
//! ## Connection Lifecycle
//!
//! 1. Read a request head (idle timeout applies between requests)
//! 2. Hand head, lazy body and a write handle to [`ApiService::handle`]
//! 3. Wait for the request's completion
//! 4. Reuse the connection only if the client asked for keep-alive, the
//!    response was not chunked, and the request body was fully consumed
//!
//! No TLS, no HTTP/2, no compression.

mod connection;
mod request;
mod service;

pub use connection::{encode_chunk, encode_head, TcpConnection, WaterMarks};
pub use request::{
    parse_query, BodyReader, HeadError, Inbound, RequestHead, SharedInbound,
    DEFAULT_MAX_HEAD_SIZE, MAX_HEADERS,
};
pub use service::ApiService;

use crate::dispatcher::{ApiResponse, BodySource, Completion, Outcome, Responder};
use crate::error::ApiError;
use crate::ids::RequestId;
use crate::router::DEFAULT_MAX_BODY_SIZE;
use crate::runtime::{spawn_coroutine, spawn_joinable, DEFAULT_STACK_SIZE};
use crate::streaming::Connection;
use may::coroutine::JoinHandle;
use may::net::{TcpListener, TcpStream};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP section of the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    /// Prefix stripped before route matching, e.g. `/yamcs`
    pub context_path: String,
    /// Body limit for routes that do not set their own
    pub default_max_body: usize,
    pub keep_alive: bool,
    /// Close a connection idle for this long between requests
    pub idle_timeout_ms: u64,
    pub max_head_size: usize,
    /// Queued bytes above which a connection stops being writable
    pub high_water_mark: usize,
    /// Queued bytes below which waiting writers are woken
    pub low_water_mark: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let marks = WaterMarks::default();
        Self {
            bind: "0.0.0.0:8090".to_string(),
            context_path: String::new(),
            default_max_body: DEFAULT_MAX_BODY_SIZE,
            keep_alive: true,
            idle_timeout_ms: 60_000,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            high_water_mark: marks.high,
            low_water_mark: marks.low,
        }
    }
}

impl HttpConfig {
    #[must_use]
    pub fn water_marks(&self) -> WaterMarks {
        WaterMarks {
            high: self.high_water_mark,
            low: self.low_water_mark.min(self.high_water_mark),
        }
    }
}

/// Accepts connections and serves them with an [`ApiService`].
pub struct HttpServer {
    service: ApiService,
    config: Arc<HttpConfig>,
    stack_size: usize,
}

/// Handle to a running server
///
/// Provides methods for waiting until the server is ready, stopping it,
/// or joining the accept loop.
pub struct ServerHandle {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ServerHandle {
    /// Address actually bound (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Poll the listening socket until it accepts connections.
    ///
    /// # Errors
    ///
    /// `TimedOut` if the server does not accept within ~250ms (50 attempts × 5ms).
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if std::net::TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Stop accepting connections. Connections already open finish their
    /// current exchange on their own.
    pub fn stop(self) {
        // SAFETY: cancelling a may coroutine is unsafe because the cancelled
        // coroutine unwinds at its next yield point. The accept loop holds no
        // locks and only owns the listener, which is dropped on unwind.
        unsafe {
            self.handle.coroutine().cancel();
        }
        if self.handle.join().is_err() {
            debug!(addr = %self.addr, "Accept loop ended by cancellation");
        }
        info!(addr = %self.addr, "Server stopped");
    }

    /// Block until the accept loop exits.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the accept loop panicked.
    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}

impl HttpServer {
    #[must_use]
    pub fn new(service: ApiService, config: HttpConfig) -> Self {
        Self {
            service,
            config: Arc::new(config),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Stack size of the accept loop and of every connection coroutine.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Bind `addr` and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub fn start<A: ToSocketAddrs>(self, addr: A) -> io::Result<ServerHandle> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            context_path = %self.service.context_path(),
            keep_alive = self.config.keep_alive,
            "Server listening"
        );

        let HttpServer {
            service,
            config,
            stack_size,
        } = self;
        let handle = spawn_joinable("accept", stack_size, move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let service = service.clone();
                let config = Arc::clone(&config);
                let spawned = spawn_coroutine("connection", stack_size, move || {
                    if let Err(e) = serve_connection(stream, &service, &config, stack_size) {
                        debug!(error = %e, "Connection ended with an error");
                    }
                });
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to spawn connection coroutine");
                }
            }
        })?;
        Ok(ServerHandle { addr, handle })
    }
}

fn serve_connection(
    stream: TcpStream,
    service: &ApiService,
    config: &HttpConfig,
    stack_size: usize,
) -> io::Result<()> {
    let peer = stream.peer_addr().ok().map(|a| a.to_string());
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = ?peer, error = %e, "TCP_NODELAY not set");
    }
    if config.idle_timeout_ms > 0 {
        stream.set_read_timeout(Some(Duration::from_millis(config.idle_timeout_ms)))?;
    }
    let read_half = stream.try_clone()?;
    let shutdown_half = stream.try_clone()?;
    let mut conn = TcpConnection::spawn(
        stream,
        peer.clone(),
        config.water_marks(),
        stack_size,
        move || {
            if let Err(e) = shutdown_half.shutdown(Shutdown::Both) {
                debug!(error = %e, "Socket shutdown failed");
            }
        },
    )?;
    let inbound = Inbound::new(Box::new(read_half)).shared();
    let peer = peer.unwrap_or_default();
    debug!(peer = %peer, "Connection opened");

    let mut served = 0u64;
    loop {
        let next = inbound
            .lock()
            .map_err(|_| io::Error::other("connection reader poisoned"))?
            .read_head(config.max_head_size);
        let head = match next {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(HeadError::Io(e)) => {
                debug!(peer = %peer, error = %e, "Connection read ended");
                break;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Rejecting malformed request");
                let mut reply = conn.clone();
                reply.set_keep_alive(false);
                let completion = Completion::new(RequestId::new());
                Responder::new(Box::new(reply), completion)
                    .send(ApiResponse::from_error(&ApiError::bad_request(e.to_string())));
                break;
            }
        };

        let keep_alive = config.keep_alive && head.wants_keep_alive();
        let (body, body_done) = if head.has_body() {
            let reader = BodyReader::new(Arc::clone(&inbound), &head);
            let done = reader.done_flag();
            let source = BodySource::Reader {
                content_length: head.content_length,
                reader: Box::new(reader),
            };
            (source, done)
        } else {
            (BodySource::Empty, Arc::new(AtomicBool::new(true)))
        };

        let mut request_conn = conn.clone();
        request_conn.set_keep_alive(keep_alive);
        let completion = service.handle(head, body, Box::new(request_conn));
        completion.wait();
        served += 1;

        let reusable = keep_alive
            && !completion.is_chunked()
            && matches!(completion.outcome(), Some(Outcome::Sent))
            && body_done.load(Ordering::Acquire)
            && conn.is_open();
        if !reusable {
            break;
        }
    }

    conn.close();
    debug!(peer = %peer, requests = served, "Connection closed");
    Ok(())
}

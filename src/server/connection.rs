//! Socket-backed [`Connection`].
//!
//! Every write is serialized to bytes on the caller's side and queued to a
//! per-connection writer coroutine. The caller never blocks on the socket;
//! instead the connection reports itself *unwritable* while the queued bytes
//! sit above the high water mark. While a session waits for writability the
//! writer signals on a channel once it drains below the low water mark;
//! with nobody waiting nothing is queued.

use crate::runtime::spawn_coroutine;
use crate::streaming::{BodyFraming, Connection, ResponseHead};
use may::sync::mpsc;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Writability thresholds, in queued bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterMarks {
    pub high: usize,
    pub low: usize,
}

impl Default for WaterMarks {
    fn default() -> Self {
        Self {
            high: 64 * 1024,
            low: 32 * 1024,
        }
    }
}

enum Outbound {
    Bytes(Vec<u8>),
    Close,
}

struct WriteState {
    pending: AtomicUsize,
    open: AtomicBool,
    written: AtomicUsize,
    /// Set while a caller is parked in `wait_writable`
    waiting: AtomicBool,
}

impl WriteState {
    fn wake(&self, drain_tx: &mpsc::Sender<()>) {
        if self.waiting.swap(false, Ordering::SeqCst) {
            let _ = drain_tx.send(());
        }
    }
}

/// Write side of one TCP connection.
///
/// Cheap to clone: the connection loop keeps one handle and gives a clone
/// to each request, with that request's keep-alive decision.
#[derive(Clone)]
pub struct TcpConnection {
    tx: mpsc::Sender<Outbound>,
    state: Arc<WriteState>,
    drained: Arc<Mutex<mpsc::Receiver<()>>>,
    marks: WaterMarks,
    keep_alive: bool,
    peer: Option<Arc<str>>,
}

impl TcpConnection {
    /// Spawn the writer coroutine over `writer`. `on_close` runs once the
    /// writer stops, after everything queued before the close was written.
    pub fn spawn<W, C>(
        mut writer: W,
        peer: Option<String>,
        marks: WaterMarks,
        stack_size: usize,
        on_close: C,
    ) -> io::Result<Self>
    where
        W: Write + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Outbound>();
        let (drain_tx, drain_rx) = mpsc::channel::<()>();
        let state = Arc::new(WriteState {
            pending: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            written: AtomicUsize::new(0),
            waiting: AtomicBool::new(false),
        });

        let writer_state = Arc::clone(&state);
        let low = marks.low;
        let log_peer = peer.clone().unwrap_or_default();
        spawn_coroutine("conn-writer", stack_size, move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    Outbound::Bytes(bytes) => {
                        let len = bytes.len();
                        let result = writer.write_all(&bytes).and_then(|()| writer.flush());
                        let before = writer_state.pending.fetch_sub(len, Ordering::SeqCst);
                        if let Err(e) = result {
                            debug!(peer = %log_peer, error = %e, "Connection write failed");
                            writer_state.open.store(false, Ordering::SeqCst);
                            writer_state.wake(&drain_tx);
                            break;
                        }
                        writer_state.written.fetch_add(len, Ordering::Relaxed);
                        if before.saturating_sub(len) < low {
                            writer_state.wake(&drain_tx);
                        }
                    }
                    Outbound::Close => break,
                }
            }
            writer_state.open.store(false, Ordering::SeqCst);
            writer_state.wake(&drain_tx);
            on_close();
            debug!(
                peer = %log_peer,
                written = writer_state.written.load(Ordering::Relaxed),
                "Connection writer stopped"
            );
        })?;

        Ok(Self {
            tx,
            state,
            drained: Arc::new(Mutex::new(drain_rx)),
            marks,
            keep_alive: true,
            peer: peer.map(Arc::from),
        })
    }

    /// Announce keep-alive (or close) in the heads written through this handle.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Bytes queued but not yet written to the socket.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    fn enqueue(&self, bytes: Vec<u8>) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection is closed",
            ));
        }
        let len = bytes.len();
        self.state.pending.fetch_add(len, Ordering::AcqRel);
        self.tx.send(Outbound::Bytes(bytes)).map_err(|_| {
            self.state.pending.fetch_sub(len, Ordering::AcqRel);
            self.state.open.store(false, Ordering::Release);
            io::Error::new(io::ErrorKind::BrokenPipe, "connection writer is gone")
        })
    }
}

/// Serialize a status line and headers.
#[must_use]
pub fn encode_head(head: &ResponseHead, keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + head.headers.len() * 32);
    let reason = head.status.canonical_reason().unwrap_or("");
    out.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", head.status.as_u16()).as_bytes());
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    match head.framing {
        BodyFraming::Length(len) => {
            out.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
            let connection = if keep_alive { "keep-alive" } else { "close" };
            out.extend_from_slice(format!("connection: {connection}\r\n").as_bytes());
        }
        BodyFraming::Chunked => {
            // the connection is closed after the terminating chunk
            out.extend_from_slice(b"transfer-encoding: chunked\r\nconnection: close\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Frame one chunk of a chunked body.
#[must_use]
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

impl Connection for TcpConnection {
    fn write_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        self.enqueue(encode_head(head, self.keep_alive))
    }

    fn write_body(&mut self, body: &[u8]) -> io::Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        self.enqueue(body.to_vec())
    }

    fn write_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.enqueue(encode_chunk(&chunk))
    }

    fn write_last_chunk(&mut self) -> io::Result<()> {
        self.enqueue(b"0\r\n\r\n".to_vec())
    }

    fn send_continue(&mut self) -> io::Result<()> {
        self.enqueue(b"HTTP/1.1 100 Continue\r\n\r\n".to_vec())
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.pending() < self.marks.high
    }

    fn wait_writable(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(drained) = self.drained.lock() else {
            return self.is_writable();
        };
        // a wake-up left over from an earlier wait that ended on its own
        while drained.try_recv().is_ok() {}
        loop {
            // register before checking, so a drain in between still wakes us
            self.state.waiting.store(true, Ordering::SeqCst);
            if self.is_writable() || !self.is_open() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || drained.recv_timeout(remaining).is_err() {
                break;
            }
        }
        self.state.waiting.store(false, Ordering::SeqCst);
        self.is_writable()
    }

    fn close(&mut self) {
        if self.is_open() {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn peer(&self) -> Option<String> {
        self.peer.as_deref().map(str::to_string)
    }
}

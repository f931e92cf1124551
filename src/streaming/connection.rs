use crate::dispatcher::HeaderVec;
use http::StatusCode;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// How the body following a [`ResponseHead`] is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes follow.
    Length(usize),
    /// `Transfer-Encoding: chunked`; ends with a zero-length chunk.
    Chunked,
}

/// Status line and headers of a response, transport independent.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderVec,
    pub framing: BodyFraming,
}

impl ResponseHead {
    #[must_use]
    pub fn new(status: StatusCode, framing: BodyFraming) -> Self {
        Self {
            status,
            headers: HeaderVec::new(),
            framing,
        }
    }

    /// Add or replace a header (case-insensitive on the name).
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((Arc::from(name), value.into()));
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.framing == BodyFraming::Chunked
    }
}

/// Write side of a client connection.
///
/// The transport owns the byte-level framing (status line, chunk sizes);
/// callers only hand over heads and payloads. Writes are queued, so a
/// successful return means "accepted", not "delivered". Flow control is
/// exposed through [`Connection::wait_writable`].
pub trait Connection: Send {
    fn write_head(&mut self, head: &ResponseHead) -> io::Result<()>;

    /// Body bytes of a fixed-length response.
    fn write_body(&mut self, body: &[u8]) -> io::Result<()>;

    /// One data chunk of a chunked response. Never called with an empty chunk.
    fn write_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()>;

    /// The zero-length terminating chunk.
    fn write_last_chunk(&mut self) -> io::Result<()>;

    /// Interim `100 Continue`, for clients that sent `Expect: 100-continue`.
    fn send_continue(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// False once the peer went away or [`Connection::close`] was called.
    fn is_open(&self) -> bool;

    /// Whether more data can be queued without exceeding the transport's
    /// buffer limit.
    fn is_writable(&self) -> bool;

    /// Block until writable, closed, or `timeout` elapsed. Returns
    /// [`Connection::is_writable`] at exit. Must wait on a primitive, not spin.
    fn wait_writable(&mut self, timeout: Duration) -> bool;

    /// Close after whatever is already queued has been written.
    fn close(&mut self);

    /// Peer address for logging, if known.
    fn peer(&self) -> Option<String> {
        None
    }
}

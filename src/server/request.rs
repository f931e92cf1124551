//! HTTP/1.1 request heads and bodies, read straight off the socket.
//!
//! [`Inbound`] owns the read half of a connection together with the bytes
//! read past the previous message, so pipelined requests survive a body
//! reader handing the connection back. [`BodyReader`] decodes
//! `Content-Length` and `Transfer-Encoding: chunked` bodies from it.

use crate::dispatcher::HeaderVec;
use crate::router::ParamVec;
use http::Method;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Header slots handed to `httparse`. Gateways and proxies add a lot.
pub const MAX_HEADERS: usize = 32;

/// Default cap on the size of a request head.
pub const DEFAULT_MAX_HEAD_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 8 * 1024;
const MAX_CHUNK_LINE: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Path without the query string, still percent-encoded
    pub path: String,
    pub query: Option<String>,
    /// Minor HTTP version: 0 or 1
    pub version: u8,
    /// Names are lowercased
    pub headers: HeaderVec,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl RequestHead {
    fn from_parsed(req: &httparse::Request<'_, '_>) -> Result<Self, HeadError> {
        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| HeadError::Malformed("invalid method".to_string()))?;
        let target = req.path.unwrap_or("/");
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };

        let mut headers = HeaderVec::new();
        let mut content_length = None;
        let mut chunked = false;
        for h in req.headers.iter() {
            let name = h.name.to_ascii_lowercase();
            let value = String::from_utf8_lossy(h.value).trim().to_string();
            match name.as_str() {
                "content-length" => {
                    let len = value.parse::<u64>().map_err(|_| {
                        HeadError::Malformed(format!("invalid content-length '{value}'"))
                    })?;
                    content_length = Some(len);
                }
                "transfer-encoding" => {
                    chunked = value
                        .rsplit(',')
                        .next()
                        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
                }
                _ => {}
            }
            headers.push((Arc::from(name), value));
        }
        if chunked {
            content_length = None;
        }

        Ok(Self {
            method,
            path,
            query,
            version: req.version.unwrap_or(1),
            headers,
            content_length,
            chunked,
        })
    }

    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client wants the connection kept open after this exchange.
    #[must_use]
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.get_header("connection").unwrap_or("");
        let has = |token: &str| {
            connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        if self.version == 0 {
            has("keep-alive")
        } else {
            !has("close")
        }
    }

    #[must_use]
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some_and(|len| len > 0)
    }

    /// Decoded query parameters, in order of appearance.
    #[must_use]
    pub fn query_params(&self) -> ParamVec {
        self.query.as_deref().map(parse_query).unwrap_or_default()
    }
}

/// Split a query string into decoded name/value pairs.
#[must_use]
pub fn parse_query(query: &str) -> ParamVec {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (Arc::from(k.as_ref()), v.into_owned()))
        .collect()
}

/// Read half of a connection plus whatever was read ahead.
pub struct Inbound {
    stream: Box<dyn Read + Send>,
    buf: Vec<u8>,
}

/// Shared between the connection loop and the body reader of the request
/// in flight. Only one of them reads at a time.
pub type SharedInbound = Arc<Mutex<Inbound>>;

impl Inbound {
    pub fn new(stream: Box<dyn Read + Send>) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    #[must_use]
    pub fn shared(self) -> SharedInbound {
        Arc::new(Mutex::new(self))
    }

    /// Bytes read but not consumed yet.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn fill(&mut self) -> io::Result<usize> {
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        let read = self.stream.read(&mut self.buf[start..]);
        let n = *read.as_ref().unwrap_or(&0);
        self.buf.truncate(start + n);
        read
    }

    /// Read the next request head. `Ok(None)` on a clean end of stream
    /// between requests.
    pub fn read_head(&mut self, max_size: usize) -> Result<Option<RequestHead>, HeadError> {
        loop {
            if !self.buf.is_empty() {
                let parsed = {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut req = httparse::Request::new(&mut headers);
                    match req.parse(&self.buf) {
                        Ok(httparse::Status::Complete(len)) => {
                            Some((RequestHead::from_parsed(&req)?, len))
                        }
                        Ok(httparse::Status::Partial) => None,
                        Err(e) => return Err(HeadError::Malformed(e.to_string())),
                    }
                };
                if let Some((head, len)) = parsed {
                    self.buf.drain(..len);
                    return Ok(Some(head));
                }
                if self.buf.len() > max_size {
                    return Err(HeadError::TooLarge(max_size));
                }
            }
            if self.fill()? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(HeadError::Malformed(
                        "connection closed in the middle of a request head".to_string(),
                    ))
                };
            }
        }
    }

    fn read_some(&mut self, out: &mut [u8], limit: u64) -> io::Result<usize> {
        if self.buf.is_empty() && self.fill()? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the request body ended",
            ));
        }
        let n = out
            .len()
            .min(self.buf.len())
            .min(usize::try_from(limit).unwrap_or(usize::MAX));
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
        Ok(n)
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf[..pos].to_vec();
                self.buf.drain(..pos + 2);
                return Ok(line);
            }
            if self.buf.len() > MAX_CHUNK_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk line too long",
                ));
            }
            if self.fill()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a chunked body",
                ));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    Length(u64),
    Chunked(ChunkState),
}

/// Request body decoder over the shared read half.
///
/// Never reads past the end of the body; bytes that belong to the next
/// request stay buffered in the [`Inbound`].
pub struct BodyReader {
    inbound: SharedInbound,
    framing: Framing,
    done: Arc<AtomicBool>,
}

impl BodyReader {
    #[must_use]
    pub fn new(inbound: SharedInbound, head: &RequestHead) -> Self {
        let framing = if head.chunked {
            Framing::Chunked(ChunkState::Size)
        } else {
            Framing::Length(head.content_length.unwrap_or(0))
        };
        let reader = Self {
            inbound,
            framing,
            done: Arc::new(AtomicBool::new(false)),
        };
        if matches!(reader.framing, Framing::Length(0)) {
            reader.done.store(true, Ordering::Release);
        }
        reader
    }

    /// Set once the whole body has been consumed. The connection can only
    /// be reused after that.
    #[must_use]
    pub fn done_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Inbound>> {
        self.inbound
            .lock()
            .map_err(|_| io::Error::other("connection reader poisoned"))
    }

    fn finish(&mut self) -> usize {
        self.done.store(true, Ordering::Release);
        0
    }

    fn read_chunked(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            let Framing::Chunked(state) = self.framing else {
                return Ok(0);
            };
            match state {
                ChunkState::Done => return Ok(self.finish()),
                ChunkState::Size => {
                    let line = self.lock()?.read_line()?;
                    let line = String::from_utf8_lossy(&line);
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid chunk size '{size_str}'"),
                        )
                    })?;
                    if size == 0 {
                        let mut inbound = self.lock()?;
                        // trailers end with an empty line
                        while !inbound.read_line()?.is_empty() {}
                        drop(inbound);
                        self.framing = Framing::Chunked(ChunkState::Done);
                    } else {
                        self.framing = Framing::Chunked(ChunkState::Data(size));
                    }
                }
                ChunkState::Data(remaining) => {
                    let n = self.lock()?.read_some(out, remaining)?;
                    let left = remaining - n as u64;
                    self.framing = Framing::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Ok(n);
                }
                ChunkState::DataEnd => {
                    if !self.lock()?.read_line()?.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk data",
                        ));
                    }
                    self.framing = Framing::Chunked(ChunkState::Size);
                }
            }
        }
    }
}

impl Read for BodyReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::Length(0) => Ok(self.finish()),
            Framing::Length(remaining) => {
                let n = self.lock()?.read_some(out, remaining)?;
                self.framing = Framing::Length(remaining - n as u64);
                if remaining == n as u64 {
                    self.done.store(true, Ordering::Release);
                }
                Ok(n)
            }
            Framing::Chunked(_) => self.read_chunked(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn inbound(raw: &str) -> SharedInbound {
        Inbound::new(Box::new(Cursor::new(raw.as_bytes().to_vec()))).shared()
    }

    #[test]
    fn parses_head_and_query() {
        let inbound = inbound(
            "GET /yamcs/api/archive/sim/parameters?start=2024&name=a%2Fb HTTP/1.1\r\nHost: x\r\nAccept: application/json\r\n\r\n",
        );
        let head = inbound.lock().unwrap().read_head(1024).unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/yamcs/api/archive/sim/parameters");
        let query = head.query_params();
        assert_eq!(query[1].1, "a/b");
        assert_eq!(head.get_header("ACCEPT"), Some("application/json"));
        assert!(head.wants_keep_alive());
        assert!(!head.has_body());
    }

    #[test]
    fn clean_eof_between_requests() {
        let inbound = inbound("");
        assert!(inbound.lock().unwrap().read_head(1024).unwrap().is_none());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n", "a".repeat(2048));
        let inbound = inbound(&raw);
        let err = inbound.lock().unwrap().read_head(512).unwrap_err();
        assert!(matches!(err, HeadError::TooLarge(512)));
    }

    #[test]
    fn content_length_body_leaves_next_request_buffered() {
        let inbound = inbound(
            "POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\n\r\n",
        );
        let head = inbound.lock().unwrap().read_head(1024).unwrap().unwrap();
        let mut reader = BodyReader::new(Arc::clone(&inbound), &head);
        let done = reader.done_flag();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello");
        assert!(done.load(Ordering::Acquire));

        let next = inbound.lock().unwrap().read_head(1024).unwrap().unwrap();
        assert_eq!(next.path, "/b");
    }

    #[test]
    fn chunked_body_is_decoded() {
        let inbound = inbound(
            "POST /load HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n",
        );
        let head = inbound.lock().unwrap().read_head(1024).unwrap().unwrap();
        assert!(head.chunked);
        let mut reader = BodyReader::new(Arc::clone(&inbound), &head);
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "Wikipedia");
        assert!(reader.done_flag().load(Ordering::Acquire));
        assert_eq!(inbound.lock().unwrap().buffered(), 0);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let inbound = inbound("POST /a HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort");
        let head = inbound.lock().unwrap().read_head(1024).unwrap().unwrap();
        let mut reader = BodyReader::new(Arc::clone(&inbound), &head);
        let mut body = Vec::new();
        let err = reader.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(!reader.done_flag().load(Ordering::Acquire));
    }

    #[test]
    fn http10_keep_alive_is_opt_in() {
        let inbound = inbound("GET / HTTP/1.0\r\n\r\n");
        let head = inbound.lock().unwrap().read_head(1024).unwrap().unwrap();
        assert!(!head.wants_keep_alive());
    }
}

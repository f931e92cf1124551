use super::response::{ApiResponse, Responder};
use crate::error::ApiError;
use crate::ids::RequestId;
use crate::router::{ParamVec, RouteRule};
use crate::streaming::{ChunkedTransferSession, Encoding, RecordEncoder, StreamOptions};
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

/// Maximum inline headers before heap allocation
pub const MAX_INLINE_HEADERS: usize = 16;

/// Header storage shared by requests and responses.
///
/// Names are `Arc<str>` (often repeated, cheap to clone); values are
/// per-request data.
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// Request body as the transport delivers it.
pub enum BodySource {
    Empty,
    /// Already in memory.
    Full(Vec<u8>),
    /// Still on the wire. `content_length` is known for non-chunked bodies.
    Reader {
        reader: Box<dyn Read + Send>,
        content_length: Option<u64>,
    },
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodySource::Empty => f.write_str("Empty"),
            BodySource::Full(b) => write!(f, "Full({} bytes)", b.len()),
            BodySource::Reader { content_length, .. } => {
                write!(f, "Reader(content_length={content_length:?})")
            }
        }
    }
}

/// Request body as the handler sees it.
pub enum RequestBody {
    /// Aggregated in full (ordinary routes).
    Bytes(Vec<u8>),
    /// Streamed (data-load routes); `None` once taken.
    Stream(Option<Box<dyn Read + Send>>),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream(s) => write!(f, "Stream(taken={})", s.is_none()),
        }
    }
}

/// A dispatched request, handed to the route handler.
///
/// Carries the matched rule, the decoded parameters, the headers, the body
/// and (until something responds) the [`Responder`].
#[derive(Debug)]
pub struct ApiRequest {
    pub request_id: RequestId,
    pub method: Method,
    /// Request path with the context path removed, no query string
    pub path: String,
    pub rule: Arc<RouteRule>,
    pub path_params: ParamVec,
    pub query_params: ParamVec,
    pub headers: HeaderVec,
    pub(crate) body: RequestBody,
    pub(crate) responder: Option<Responder>,
    pub(crate) stream_defaults: StreamOptions,
}

impl ApiRequest {
    /// Get a path parameter by name. Absent optional parameters yield `None`.
    #[inline]
    #[must_use]
    pub fn get_path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .rfind(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }

    /// A path parameter the template guarantees; missing means a routing bug.
    pub fn path_param(&self, name: &str) -> Result<&str, ApiError> {
        self.get_path_param(name)
            .ok_or_else(|| ApiError::internal(format!("path parameter '{name}' not captured")))
    }

    /// Get a query parameter by name ("last write wins" on repeats).
    #[inline]
    #[must_use]
    pub fn get_query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .iter()
            .rfind(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse a query parameter; a value that does not parse is a BadRequest.
    pub fn query_param_as<T: FromStr>(&self, name: &str) -> Result<Option<T>, ApiError> {
        match self.get_query_param(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                ApiError::bad_request(format!("invalid value '{raw}' for query parameter '{name}'"))
            }),
        }
    }

    /// True for `?name`, `?name=` and `?name=true`.
    #[must_use]
    pub fn query_flag(&self, name: &str) -> bool {
        matches!(self.get_query_param(name), Some("" | "true"))
    }

    /// Get a header by name (case-insensitive per RFC 7230)
    #[inline]
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Convert query_params to a HashMap. Allocates.
    #[must_use]
    pub fn query_params_map(&self) -> HashMap<String, String> {
        self.query_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Aggregated body. Empty for streamed (data-load) requests.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        match &self.body {
            RequestBody::Bytes(b) => b,
            RequestBody::Stream(_) => &[],
        }
    }

    /// Deserialize the aggregated body as JSON.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(self.body())
            .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
    }

    /// Take the streamed body of a data-load request.
    pub fn take_body_stream(&mut self) -> Option<Box<dyn Read + Send>> {
        match &mut self.body {
            RequestBody::Stream(s) => s.take(),
            RequestBody::Bytes(_) => None,
        }
    }

    /// Encoding negotiated from the `Accept` header.
    #[must_use]
    pub fn negotiate_encoding(&self) -> Encoding {
        Encoding::negotiate(self.get_header("accept"))
    }

    /// Chunking defaults from the server configuration, to adjust per call.
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        self.stream_defaults.clone()
    }

    /// Whether a response (or a chunked session) has already taken over.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.responder.is_none()
    }

    /// Take the responder to answer later or elsewhere. The request is then
    /// no longer answered by the dispatcher, whatever the handler returns.
    pub fn take_responder(&mut self) -> Option<Responder> {
        self.responder.take()
    }

    fn responder(&mut self) -> Result<Responder, ApiError> {
        self.responder
            .take()
            .ok_or_else(|| ApiError::internal("response already committed"))
    }

    pub fn respond(&mut self, resp: ApiResponse) -> Result<(), ApiError> {
        self.responder()?.send(resp);
        Ok(())
    }

    pub fn respond_json<T: Serialize>(&mut self, status: StatusCode, body: &T) -> Result<(), ApiError> {
        let value = serde_json::to_value(body).map_err(ApiError::internal)?;
        self.respond(ApiResponse::json(status, &value))
    }

    /// Commit a `200 OK` chunked response and return the streaming session.
    pub fn start_chunked<E: RecordEncoder>(
        &mut self,
        encoder: E,
        options: StreamOptions,
    ) -> Result<ChunkedTransferSession<E>, ApiError> {
        let responder = self.responder()?;
        ChunkedTransferSession::start(responder, encoder, options).map_err(ApiError::internal)
    }
}

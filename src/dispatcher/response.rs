use super::completion::Completion;
use super::request::HeaderVec;
use crate::error::ApiError;
use crate::streaming::{BodyFraming, Connection, ResponseHead};
use http::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A complete (fixed-length) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderVec,
    pub body: Vec<u8>,
}

impl ApiResponse {
    #[must_use]
    pub fn new(status: StatusCode, content_type: &str, body: Vec<u8>) -> Self {
        let mut headers = HeaderVec::new();
        headers.push((Arc::from("content-type"), content_type.to_string()));
        Self {
            status,
            headers,
            body,
        }
    }

    #[must_use]
    pub fn json(status: StatusCode, body: &Value) -> Self {
        Self::new(
            status,
            "application/json",
            serde_json::to_vec(body).unwrap_or_default(),
        )
    }

    #[must_use]
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body.into().into_bytes())
    }

    #[must_use]
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderVec::new(),
            body: Vec::new(),
        }
    }

    /// Structured error response, with `Allow` for method mismatches.
    #[must_use]
    pub fn from_error(err: &ApiError) -> Self {
        let mut resp = Self::json(err.status(), &err.to_body());
        if let Some(allowed) = err.allowed_methods() {
            let allow = allowed
                .iter()
                .map(http::Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            resp.set_header("allow", allow);
        }
        resp
    }

    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((Arc::from(name), value.into()));
    }

    fn head(&self) -> ResponseHead {
        ResponseHead {
            status: self.status,
            headers: self.headers.clone(),
            framing: BodyFraming::Length(self.body.len()),
        }
    }
}

/// Exclusive right to answer one request.
///
/// Whoever holds the responder decides what goes on the wire: a single
/// [`ApiResponse`] via [`Responder::send`], or a chunked session via
/// [`crate::streaming::ChunkedTransferSession::start`]. Either path completes
/// the request's [`Completion`].
pub struct Responder {
    conn: Box<dyn Connection>,
    completion: Completion,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.completion.request_id())
            .field("open", &self.conn.is_open())
            .finish_non_exhaustive()
    }
}

impl Responder {
    #[must_use]
    pub fn new(conn: Box<dyn Connection>, completion: Completion) -> Self {
        Self { conn, completion }
    }

    #[must_use]
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Write a complete response and mark the request done.
    pub fn send(mut self, resp: ApiResponse) {
        let request_id = self.completion.request_id();
        let status = resp.status.as_u16();
        let result = self
            .conn
            .write_head(&resp.head())
            .and_then(|()| self.conn.write_body(&resp.body));
        match result {
            Ok(()) => {
                self.completion.set_status(status, false);
                self.completion.add_transferred(resp.body.len() as u64);
                self.completion.complete_ok();
                debug!(
                    request_id = %request_id,
                    status,
                    body_size = resp.body.len(),
                    "Response sent"
                );
            }
            Err(e) => {
                warn!(request_id = %request_id, status, error = %e, "Failed to write response");
                self.conn.close();
                self.completion.complete_err(e.to_string());
            }
        }
    }

    pub fn send_json(self, status: StatusCode, body: &Value) {
        self.send(ApiResponse::json(status, body));
    }

    /// Turn an error into its structured response. Server errors keep their
    /// detail in the log only.
    pub fn send_error(self, err: &ApiError) {
        if err.is_server_error() {
            error!(
                request_id = %self.completion.request_id(),
                kind = err.kind(),
                error = %err,
                "Request failed"
            );
        } else {
            debug!(
                request_id = %self.completion.request_id(),
                kind = err.kind(),
                error = %err,
                "Request rejected"
            );
        }
        self.send(ApiResponse::from_error(err));
    }

    /// Give up without writing anything (the client is already gone).
    pub fn abandon(mut self, reason: &str) {
        self.conn.close();
        self.completion.complete_err(reason);
    }

    pub(crate) fn into_parts(self) -> (Box<dyn Connection>, Completion) {
        (self.conn, self.completion)
    }

    pub(crate) fn connection_mut(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }
}

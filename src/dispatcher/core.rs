//! Dispatcher core module - hot path for request dispatch.
//!
//! Turns a resolved [`RouteMatch`] plus the raw request into an
//! [`ApiRequest`], runs the handler inline or on the worker pool, and makes
//! sure every request ends in exactly one response (or one closed
//! connection, once a chunked response has started).

#![deny(clippy::inefficient_to_string)]
#![deny(clippy::format_push_string)]

use super::completion::Completion;
use super::request::{ApiRequest, BodySource, HeaderVec, RequestBody};
use super::response::Responder;
use crate::error::ApiError;
use crate::ids::RequestId;
use crate::router::{RouteMatch, DEFAULT_MAX_BODY_SIZE};
use crate::runtime::spawn_coroutine;
use crate::streaming::{Connection, StreamOptions, StreamingConfig};
use crate::worker_pool::{PoolSnapshot, WorkerPool, WorkerPoolConfig};
use http::Method;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io::{Cursor, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WATCHDOG_STACK_SIZE: usize = 0x8000;

/// Watchdog thresholds. Diagnostics only: nothing is ever cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Warn when an inline handler still has not returned after this long
    pub inline_warn_ms: u64,
    /// Warn when an inline request is still incomplete after this long
    pub inline_slow_ms: u64,
    /// Warn when an off-thread request is still incomplete after this long
    pub off_thread_slow_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inline_warn_ms: 2_000,
            inline_slow_ms: 20_000,
            off_thread_slow_ms: 120_000,
        }
    }
}

/// Raw request as handed over by the transport.
pub struct IncomingRequest {
    pub request_id: RequestId,
    pub method: Method,
    /// Path with the context path removed, no query string
    pub path: String,
    pub headers: HeaderVec,
    pub body: BodySource,
    pub conn: Box<dyn Connection>,
}

impl IncomingRequest {
    #[must_use]
    pub fn expects_continue(&self) -> bool {
        self.headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("expect") && v.eq_ignore_ascii_case("100-continue"))
    }
}

/// Runs handlers for resolved routes.
pub struct Dispatcher {
    config: DispatchConfig,
    default_max_body: usize,
    stream_defaults: StreamOptions,
    pool: Arc<WorkerPool<ApiRequest>>,
}

impl Dispatcher {
    /// Build the dispatcher and spawn the off-thread worker pool.
    pub fn new(
        config: DispatchConfig,
        workers: WorkerPoolConfig,
        streaming: &StreamingConfig,
        default_max_body: usize,
    ) -> std::io::Result<Self> {
        let pool = WorkerPool::new("handlers", workers, execute)?;
        Ok(Self {
            config,
            default_max_body,
            stream_defaults: StreamOptions::from_config(streaming),
            pool: Arc::new(pool),
        })
    }

    /// Dispatcher with default settings everywhere.
    pub fn with_defaults() -> std::io::Result<Self> {
        Self::new(
            DispatchConfig::default(),
            WorkerPoolConfig::default(),
            &StreamingConfig::default(),
            DEFAULT_MAX_BODY_SIZE,
        )
    }

    /// Dispatch one request. The returned handle completes when the
    /// response has been written (or the request failed).
    pub fn dispatch(&self, route_match: RouteMatch, incoming: IncomingRequest) -> Completion {
        let RouteMatch {
            rule,
            path_params,
            query_params,
        } = route_match;
        let expects_continue = incoming.expects_continue();
        let IncomingRequest {
            request_id,
            method,
            path,
            headers,
            body,
            conn,
        } = incoming;

        let completion = Completion::new(request_id);
        let mut responder = Responder::new(conn, completion.clone());
        let inline = rule.is_data_load() || !rule.is_off_thread();

        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            route = %rule.name(),
            inline,
            data_load = rule.is_data_load(),
            "Request dispatched"
        );

        let body = if rule.is_data_load() {
            if expects_continue {
                if let Err(e) = responder.connection_mut().send_continue() {
                    debug!(request_id = %request_id, error = %e, "Failed to send 100 Continue");
                    responder.abandon("client went away before the upload");
                    return completion;
                }
            }
            RequestBody::Stream(match body {
                BodySource::Empty => None,
                BodySource::Full(bytes) => Some(Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>),
                BodySource::Reader { reader, .. } => Some(reader),
            })
        } else {
            let limit = rule.body_limit().unwrap_or(self.default_max_body);
            match aggregate_body(body, limit, expects_continue, &mut responder) {
                Ok(bytes) => RequestBody::Bytes(bytes),
                Err(err) => {
                    responder.send_error(&err);
                    return completion;
                }
            }
        };

        let request = ApiRequest {
            request_id,
            method,
            path,
            rule,
            path_params,
            query_params,
            headers,
            body,
            responder: Some(responder),
            stream_defaults: self.stream_defaults.clone(),
        };

        let returned = Arc::new(AtomicBool::new(false));
        self.arm_watchdog(&request, inline, Arc::clone(&returned));

        if inline {
            execute(request);
            returned.store(true, Ordering::Release);
        } else {
            returned.store(true, Ordering::Release);
            if let Err(mut rejected) = self.pool.submit(request) {
                if let Some(responder) = rejected.take_responder() {
                    responder.send_error(&ApiError::ServiceUnavailable(
                        "server is busy, try again later".to_string(),
                    ));
                }
            }
        }
        completion
    }

    fn arm_watchdog(&self, request: &ApiRequest, inline: bool, returned: Arc<AtomicBool>) {
        let Some(completion) = request.responder.as_ref().map(|r| r.completion().clone()) else {
            return;
        };
        let done = completion.subscribe();
        let warn_after = inline.then(|| Duration::from_millis(self.config.inline_warn_ms));
        let slow_after = Duration::from_millis(if inline {
            self.config.inline_slow_ms
        } else {
            self.config.off_thread_slow_ms
        });
        let request_id = request.request_id;
        let route = request.rule.name().to_string();
        let path = request.path.clone();

        let spawned = spawn_coroutine("watchdog", WATCHDOG_STACK_SIZE, move || {
            let start = Instant::now();
            if let Some(warn_after) = warn_after {
                if done.recv_timeout(warn_after).is_ok() {
                    return;
                }
                if !returned.load(Ordering::Acquire) {
                    warn!(
                        request_id = %request_id,
                        route = %route,
                        path = %path,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Handler is blocking the connection context; mark the route off-thread"
                    );
                }
            }
            if done
                .recv_timeout(slow_after.saturating_sub(start.elapsed()))
                .is_ok()
            {
                return;
            }
            warn!(
                request_id = %request_id,
                route = %route,
                path = %path,
                elapsed_ms = start.elapsed().as_millis() as u64,
                transferred = completion.transferred(),
                "Request has not completed yet"
            );
        });
        if let Err(e) = spawned {
            debug!(request_id = %request_id, error = %e, "Watchdog not armed");
        }
    }

    #[must_use]
    pub fn pool_metrics(&self) -> PoolSnapshot {
        self.pool.metrics().snapshot()
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn default_max_body(&self) -> usize {
        self.default_max_body
    }
}

fn aggregate_body(
    body: BodySource,
    limit: usize,
    expects_continue: bool,
    responder: &mut Responder,
) -> Result<Vec<u8>, ApiError> {
    let too_large = |size: u64| {
        ApiError::bad_request(format!(
            "request body of {size} bytes exceeds the limit of {limit} bytes"
        ))
    };
    match body {
        BodySource::Empty => Ok(Vec::new()),
        BodySource::Full(bytes) if bytes.len() > limit => Err(too_large(bytes.len() as u64)),
        BodySource::Full(bytes) => Ok(bytes),
        BodySource::Reader {
            reader,
            content_length,
        } => {
            if let Some(len) = content_length.filter(|&len| len > limit as u64) {
                return Err(too_large(len));
            }
            if expects_continue {
                responder
                    .connection_mut()
                    .send_continue()
                    .map_err(ApiError::internal)?;
            }
            let hint = content_length.map_or(0, |len| len as usize);
            let mut buf = Vec::with_capacity(hint.min(limit));
            reader
                .take(limit as u64 + 1)
                .read_to_end(&mut buf)
                .map_err(|e| ApiError::bad_request(format!("failed to read request body: {e}")))?;
            if buf.len() > limit {
                return Err(too_large(buf.len() as u64));
            }
            Ok(buf)
        }
    }
}

/// Run the handler and settle the request, whatever the handler did.
fn execute(mut request: ApiRequest) {
    let handler = Arc::clone(request.rule.handler());
    let started = Instant::now();
    let result = match catch_unwind(AssertUnwindSafe(|| handler(&mut request))) {
        Ok(result) => result,
        Err(panic) => {
            error!(
                request_id = %request.request_id,
                route = %request.rule.name(),
                panic_message = %panic_message(panic.as_ref()),
                "Handler panicked"
            );
            Err(ApiError::internal("handler panicked"))
        }
    };

    match result {
        Ok(()) => {
            if let Some(responder) = request.take_responder() {
                error!(
                    request_id = %request.request_id,
                    route = %request.rule.name(),
                    "Handler returned without responding"
                );
                responder.send_error(&ApiError::internal("handler returned without a response"));
            }
        }
        Err(err) => match request.take_responder() {
            Some(responder) => responder.send_error(&err),
            None => warn!(
                request_id = %request.request_id,
                route = %request.rule.name(),
                error = %err,
                "Handler failed after the response was committed"
            ),
        },
    }

    debug!(
        request_id = %request.request_id,
        route = %request.rule.name(),
        handler_ms = started.elapsed().as_millis() as u64,
        "Handler returned"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! # Dispatcher Module
//!
//! Runs route handlers and guarantees every request is settled exactly once.
//!
//! ## Request Flow
//!
//! 1. The service resolves the route and hands the raw request over as an
//!    [`IncomingRequest`]
//! 2. Data-load routes get their body as a stream and run immediately on
//!    the connection coroutine (after `100 Continue` if the client asked)
//! 3. Other routes get their body aggregated up to the rule's limit
//!    (BadRequest beyond it), then run inline or on the worker pool
//!    depending on the rule's off-thread flag
//! 4. A watchdog coroutine warns about inline handlers that block for more
//!    than 2 s and about requests still incomplete after 20 s (inline) or
//!    120 s (off-thread). It never cancels anything
//! 5. The handler answers through [`ApiRequest`]: one [`ApiResponse`], a
//!    chunked session, or by taking the [`Responder`] to finish later
//!
//! ## Error Handling
//!
//! - A handler `Err` before anything was written becomes a structured
//!   error response
//! - A handler panic is caught and becomes a 500
//! - A handler that returns `Ok` without responding gets a 500
//! - An error after the response was committed is only logged; the
//!   streaming session has already closed the connection
//! - A saturated worker pool answers 503
//!
//! Every dispatch returns a [`Completion`] the transport waits on before
//! reading the next request from the connection.

mod completion;
mod core;
mod request;
mod response;

pub use completion::{Completion, Outcome};
pub use core::{DispatchConfig, Dispatcher, IncomingRequest};
pub use request::{ApiRequest, BodySource, HeaderVec, RequestBody, MAX_INLINE_HEADERS};
pub use response::{ApiResponse, Responder};

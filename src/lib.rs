//! # mcs-gateway
//!
//! **mcs-gateway** is the request-dispatch and streaming-response core of a
//! mission-control ground-system HTTP API, built on the `may` coroutine
//! runtime.
//!
//! ## Overview
//!
//! Clients (operator consoles, scripts, archive exporters) send HTTP
//! requests. The gateway routes each one to a handler, runs it in the right
//! execution context, and streams large result sets back with chunked
//! transfer encoding and backpressure. Handlers that need live values
//! ("give me the current value of these parameters") collect them from an
//! asynchronous distribution feed with a hard deadline.
//!
//! ## Architecture
//!
//! - **[`router`]** - Route templates compiled to anchored patterns, a
//!   two-tier (static, then per-instance) route table, resolution to a
//!   match, a method mismatch or no match
//! - **[`dispatcher`]** - Body aggregation or streaming, inline or
//!   off-thread execution, the slow-request watchdog, and the guarantee
//!   that every request settles exactly once
//! - **[`streaming`]** - Chunked transfer sessions: buffered encoding,
//!   threshold-sized chunks, writability waits, clean abort
//! - **[`collect`]** - The bounded collection bridge over a push-based feed
//! - **[`server`]** - The minimal HTTP/1.1 transport and [`server::ApiService`]
//! - **[`worker_pool`]** - Bounded coroutine pool for off-thread handlers
//! - **[`config`]** / **[`logging`]** - YAML plus environment configuration,
//!   structured `tracing` output
//! - **[`testing`]** - In-memory connection and feed doubles
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Server as server::serve_connection
//!     participant Service as ApiService
//!     participant Table as RouteTable
//!     participant Dispatcher
//!     participant Handler
//!
//!     Client->>Server: GET /yamcs/api/archive/sim/samples
//!     Server->>Service: handle(head, body, connection)
//!     Service->>Table: resolve(GET, /api/archive/sim/samples)
//!     Table-->>Service: Matched(rule, params)
//!     Service->>Dispatcher: dispatch(match, request)
//!     Dispatcher->>Handler: run (inline or worker pool)
//!     Handler->>Client: 200, chunks..., zero-length chunk
//!     Dispatcher-->>Server: Completion
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mcs_gateway::config::ServerConfig;
//! use mcs_gateway::router::RouteRule;
//! use mcs_gateway::server::{ApiService, HttpServer};
//!
//! let config = ServerConfig::default();
//! let service = ApiService::new(&config)?;
//! service.register_instance("simulator", &|| {
//!     vec![RouteRule::get("/api/processors/:instance/:processor", |req| {
//!         let processor = req.path_param("processor")?.to_string();
//!         req.respond_json(http::StatusCode::OK, &serde_json::json!({ "name": processor }))
//!     })]
//! })?;
//! let handle = HttpServer::new(service, config.http.clone()).start("127.0.0.1:8090")?;
//! handle.join().ok();
//! ```
//!
//! ## Error Handling
//!
//! Failures before anything was written become one structured JSON error
//! response ([`error::ApiError`]). Failures after a chunked response started
//! ([`streaming::StreamError`]) close the connection instead: the status
//! line is already on the wire.

pub mod cli;
pub mod collect;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod logging;
pub mod router;
pub mod runtime;
pub mod server;
pub mod streaming;
pub mod testing;
pub mod worker_pool;

pub use error::ApiError;
pub use ids::{RequestId, SubscriptionId};

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use http::Method;
use mcs_gateway::collect::Keyed;
use mcs_gateway::dispatcher::{
    BodySource, Completion, DispatchConfig, Dispatcher, HeaderVec, IncomingRequest,
};
use mcs_gateway::ids::RequestId;
use mcs_gateway::router::{RouteMatch, RouteTable};
use mcs_gateway::streaming::StreamingConfig;
use mcs_gateway::testing::RecordingConnection;
use mcs_gateway::worker_pool::WorkerPoolConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Dispatcher with a small pool, suitable for tests.
pub fn dispatcher() -> Dispatcher {
    dispatcher_with(WorkerPoolConfig {
        num_workers: 2,
        queue_bound: 16,
        stack_size: 0x10000,
        ..WorkerPoolConfig::default()
    })
}

pub fn dispatcher_with(workers: WorkerPoolConfig) -> Dispatcher {
    Dispatcher::new(
        DispatchConfig::default(),
        workers,
        &StreamingConfig::default(),
        1024,
    )
    .unwrap()
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderVec {
    pairs
        .iter()
        .map(|(k, v)| (Arc::from(k.to_ascii_lowercase().as_str()), (*v).to_string()))
        .collect()
}

pub fn incoming(
    method: Method,
    path: &str,
    header_pairs: &[(&str, &str)],
    body: BodySource,
    conn: &RecordingConnection,
) -> IncomingRequest {
    IncomingRequest {
        request_id: RequestId::new(),
        method,
        path: path.to_string(),
        headers: headers(header_pairs),
        body,
        conn: conn.boxed(),
    }
}

pub fn resolve(table: &RouteTable, method: &Method, path: &str) -> RouteMatch {
    table
        .resolve(method, path)
        .into_result(method, path)
        .expect("route should resolve")
}

/// Resolve and dispatch, then wait for the request to settle.
pub fn run(
    dispatcher: &Dispatcher,
    table: &RouteTable,
    method: Method,
    path: &str,
    body: BodySource,
) -> (Completion, RecordingConnection) {
    let conn = RecordingConnection::new();
    let route_match = resolve(table, &method, path);
    let completion = dispatcher.dispatch(route_match, incoming(method, path, &[], body, &conn));
    assert!(
        completion.wait_timeout(Duration::from_secs(5)),
        "request did not complete"
    );
    (completion, conn)
}

/// A telemetry parameter value as a feed would deliver it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamValue {
    pub name: String,
    pub value: f64,
}

impl ParamValue {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

impl Keyed for ParamValue {
    type Key = String;

    fn key(&self) -> &String {
        &self.name
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

//! End-to-end tests over a real socket: framing, context path, keep-alive,
//! chunked streams and `100 Continue`.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use http::StatusCode;
use mcs_gateway::config::ServerConfig;
use mcs_gateway::dispatcher::ApiResponse;
use mcs_gateway::handlers::InstanceHandlers;
use mcs_gateway::router::{RouteProvider, RouteRule};
use mcs_gateway::server::{ApiService, HttpServer, ServerHandle};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

struct Uploads;

impl RouteProvider for Uploads {
    fn routes(&self) -> Vec<RouteRule> {
        vec![
            RouteRule::post("/api/echo", |req| {
                let body = req.body().to_vec();
                req.respond(ApiResponse::new(StatusCode::OK, "application/octet-stream", body))
            }),
            RouteRule::post("/api/buckets/:bucket/objects:upload", |req| {
                let mut stream = req.take_body_stream().unwrap();
                let mut total = 0usize;
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).map_err(mcs_gateway::ApiError::internal)?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                req.respond_json(StatusCode::OK, &json!({ "bytes": total }))
            })
            .data_load(),
        ]
    }
}

fn start(context_path: &str) -> ServerHandle {
    let mut config = ServerConfig::default();
    config.http.context_path = context_path.to_string();
    config.http.idle_timeout_ms = 5_000;
    config.workers.num_workers = 2;
    let service = ApiService::new(&config).unwrap();
    service.register_instance("sim", &InstanceHandlers).unwrap();
    service.register_handlers(&Uploads).unwrap();
    let handle = HttpServer::new(service, config.http.clone())
        .start("127.0.0.1:0")
        .unwrap();
    handle.wait_ready().unwrap();
    handle
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

fn connect(handle: &ServerHandle) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    BufReader::new(stream)
}

fn read_head(reader: &mut BufReader<TcpStream>) -> (u16, Vec<(String, String)>) {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line: {status_line:?}"));
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    (status, headers)
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> Reply {
    let (status, headers) = read_head(reader);
    let mut reply = Reply {
        status,
        headers,
        body: Vec::new(),
    };
    if reply.header("transfer-encoding") == Some("chunked") {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).unwrap();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            let mut data = vec![0u8; size + 2];
            reader.read_exact(&mut data).unwrap();
            if size == 0 {
                break;
            }
            reply.body.extend_from_slice(&data[..size]);
        }
    } else {
        let len: usize = reply.header("content-length").unwrap().parse().unwrap();
        reply.body.resize(len, 0);
        reader.read_exact(&mut reply.body).unwrap();
    }
    reply
}

fn send(reader: &mut BufReader<TcpStream>, request: &str) {
    reader.get_mut().write_all(request.as_bytes()).unwrap();
}

fn get(handle: &ServerHandle, path: &str) -> Reply {
    let mut conn = connect(handle);
    send(
        &mut conn,
        &format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n"),
    );
    read_reply(&mut conn)
}

fn at_eof(reader: &mut BufReader<TcpStream>) -> bool {
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).map(|n| n == 0).unwrap_or(true)
}

#[test]
fn test_health_and_overview() {
    let server = start("");
    let health = get(&server, "/api/health");
    assert_eq!(health.status, 200);
    assert_eq!(health.json(), json!({ "status": "ok" }));

    let overview = get(&server, "/api");
    assert_eq!(overview.status, 200);
    let routes = overview.json()["routes"].as_array().unwrap().clone();
    let templates: Vec<&str> = routes
        .iter()
        .filter_map(|r| r["url"].as_str())
        .collect();
    assert!(templates.contains(&"/api/health"));
    assert!(templates.contains(&"/api/echo"));
    // instance routes are not part of the overview
    assert!(!templates.contains(&"/api/instances/sim"));
    server.stop();
}

#[test]
fn test_context_path_is_stripped() {
    let server = start("/yamcs");
    let reply = get(&server, "/yamcs/api/instances/sim?pretty");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["name"], "sim");

    let outside = get(&server, "/api/instances/sim");
    assert_eq!(outside.status, 404);
    let partial = get(&server, "/yamcsx/api/health");
    assert_eq!(partial.status, 404);
    server.stop();
}

#[test]
fn test_not_found_and_method_not_allowed() {
    let server = start("");
    let missing = get(&server, "/api/instances/other");
    assert_eq!(missing.status, 404);
    assert_eq!(missing.json()["error"]["kind"], "NotFound");

    let mut conn = connect(&server);
    send(
        &mut conn,
        "DELETE /api/health HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
    );
    let reply = read_reply(&mut conn);
    assert_eq!(reply.status, 405);
    assert_eq!(reply.header("allow"), Some("GET"));
    assert_eq!(reply.json()["error"]["allowed"], json!(["GET"]));
    server.stop();
}

#[test]
fn test_keep_alive_serves_several_requests() {
    let server = start("");
    let mut conn = connect(&server);
    for _ in 0..3 {
        send(&mut conn, "GET /api/health HTTP/1.1\r\nhost: localhost\r\n\r\n");
        let reply = read_reply(&mut conn);
        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("connection"), Some("keep-alive"));
    }
    // pipelined: both requests in one write
    send(
        &mut conn,
        "POST /api/echo HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello\
         GET /api/health HTTP/1.1\r\nconnection: close\r\n\r\n",
    );
    let echo = read_reply(&mut conn);
    assert_eq!(echo.body, b"hello");
    let last = read_reply(&mut conn);
    assert_eq!(last.status, 200);
    assert_eq!(last.header("connection"), Some("close"));
    assert!(at_eof(&mut conn));
    server.stop();
}

#[test]
fn test_chunked_request_body_is_decoded() {
    let server = start("");
    let mut conn = connect(&server);
    send(
        &mut conn,
        "POST /api/echo HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n\
         4\r\nwiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n",
    );
    let reply = read_reply(&mut conn);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"wikipedia");
    server.stop();
}

#[test]
fn test_sample_stream_is_chunked_and_closes() {
    let server = start("");
    let mut conn = connect(&server);
    send(
        &mut conn,
        "GET /api/archive/sim/samples?count=20000 HTTP/1.1\r\naccept: application/json\r\n\r\n",
    );
    let reply = read_reply(&mut conn);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
    assert_eq!(reply.header("connection"), Some("close"));
    let lines: Vec<Value> = reply
        .body
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_slice(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 20_000);
    assert_eq!(lines[19_999]["seq"], 19_999);
    assert!(at_eof(&mut conn));
    server.stop();
}

#[test]
fn test_bad_count_is_rejected_before_streaming() {
    let server = start("");
    let reply = get(&server, "/api/archive/sim/samples?count=-3");
    assert_eq!(reply.status, 400);
    assert_eq!(reply.json()["error"]["kind"], "BadRequest");
    server.stop();
}

#[test]
fn test_upload_waits_for_continue() {
    let server = start("");
    let mut conn = connect(&server);
    send(
        &mut conn,
        "POST /api/buckets/user/objects:upload HTTP/1.1\r\n\
         content-length: 10000\r\nexpect: 100-continue\r\n\r\n",
    );
    let (status, _) = read_head(&mut conn);
    assert_eq!(status, 100);

    send(&mut conn, &"x".repeat(10_000));
    let reply = read_reply(&mut conn);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json(), json!({ "bytes": 10_000 }));
    server.stop();
}

#[test]
fn test_malformed_request_gets_400_and_close() {
    let server = start("");
    let mut conn = connect(&server);
    send(&mut conn, "THIS IS NOT HTTP\r\n\r\n");
    let reply = read_reply(&mut conn);
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("connection"), Some("close"));
    assert!(at_eof(&mut conn));
    server.stop();
}

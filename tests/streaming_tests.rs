//! Chunked transfer sessions: chunk sizing, termination, failure and
//! backpressure, observed through a recording connection.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{dispatcher, incoming, resolve};
use http::Method;
use mcs_gateway::dispatcher::{BodySource, Completion, Outcome, Responder};
use mcs_gateway::handlers::{InstanceHandlers, SampleRecord};
use mcs_gateway::ids::RequestId;
use mcs_gateway::router::{RouteProvider, RouteTable};
use mcs_gateway::streaming::{
    stream_records, BinaryEncoder, CancelFlag, ChunkedTransferSession, CsvEncoder, CsvRecord,
    JsonEncoder, RecordListener, StreamError, StreamOptions, DEFAULT_CHUNK_THRESHOLD,
};
use mcs_gateway::testing::RecordingConnection;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Packet {
    seq: u64,
    name: String,
}

impl Packet {
    /// Roughly 100 bytes once serialized as JSON.
    fn new(seq: u64) -> Self {
        Self {
            seq,
            name: format!("/YSS/SIMULATOR/{:0>70}", seq),
        }
    }
}

impl CsvRecord for Packet {
    fn csv_fields(&self) -> Vec<String> {
        vec![self.seq.to_string(), self.name.clone()]
    }
}

fn session<E: mcs_gateway::streaming::RecordEncoder>(
    encoder: E,
    options: StreamOptions,
) -> (ChunkedTransferSession<E>, RecordingConnection, Completion) {
    let conn = RecordingConnection::new();
    let completion = Completion::new(RequestId::new());
    let responder = Responder::new(conn.boxed(), completion.clone());
    let session = ChunkedTransferSession::start(responder, encoder, options).unwrap();
    (session, conn, completion)
}

fn decode_lines(payload: &[u8]) -> Vec<Packet> {
    payload
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect()
}

#[test]
fn test_every_chunk_but_the_last_reaches_the_threshold() {
    let (mut session, conn, completion) = session(
        JsonEncoder::<Packet>::new(),
        StreamOptions::default().threshold(DEFAULT_CHUNK_THRESHOLD),
    );
    let mut expected_bytes = 0u64;
    for seq in 0..10_050 {
        let packet = Packet::new(seq);
        expected_bytes += serde_json::to_vec(&packet).unwrap().len() as u64 + 1;
        session.accept(&packet).unwrap();
    }
    let stats = session.finish().unwrap();

    let recorded = conn.recorded();
    let (last, full) = recorded.chunks.split_last().unwrap();
    assert!(!last.is_empty());
    for chunk in full {
        assert!(chunk.len() >= DEFAULT_CHUNK_THRESHOLD);
    }
    let written: u64 = recorded.chunks.iter().map(|c| c.len() as u64).sum();
    assert_eq!(written, expected_bytes);
    assert_eq!(stats.total_bytes, expected_bytes);
    assert_eq!(stats.chunk_count, recorded.chunks.len() as u64);
    assert_eq!(stats.records, 10_050);
    assert!(recorded.last_chunk);
    assert_eq!(recorded.heads_written, 1);
    assert!(recorded.closed);

    let packets = decode_lines(&conn.chunked_payload());
    assert_eq!(packets.len(), 10_050);
    assert!(packets.iter().enumerate().all(|(i, p)| p.seq == i as u64));

    assert_eq!(completion.outcome(), Some(&Outcome::Sent));
    assert!(completion.is_chunked());
    assert_eq!(completion.status(), Some(200));
    assert_eq!(completion.transferred(), expected_bytes);
}

#[test]
fn test_finish_after_finish_is_refused() {
    let (mut session, conn, _) = session(JsonEncoder::<Packet>::new(), StreamOptions::default());
    session.accept(&Packet::new(0)).unwrap();
    session.finish().unwrap();
    assert!(matches!(session.finish(), Err(StreamError::Aborted)));
    assert!(matches!(session.accept(&Packet::new(1)), Err(StreamError::Aborted)));
    assert!(conn.recorded().last_chunk);
}

#[test]
fn test_empty_stream_writes_only_the_terminator() {
    let (mut session, conn, completion) =
        session(JsonEncoder::<Packet>::new(), StreamOptions::default());
    let stats = session.finish().unwrap();
    assert_eq!(stats.chunk_count, 0);
    let recorded = conn.recorded();
    assert!(recorded.chunks.is_empty());
    assert!(recorded.last_chunk);
    assert_eq!(completion.outcome(), Some(&Outcome::Sent));
}

#[test]
fn test_producer_error_stops_the_stream() {
    let (mut session, conn, completion) = session(
        JsonEncoder::<Packet>::new(),
        StreamOptions::default().threshold(1024),
    );
    let producer = CancelFlag::new();
    session.set_producer(Box::new(producer.clone()));

    const FAIL_AFTER: u64 = 500;
    for seq in 0..FAIL_AFTER {
        session.on_record(Packet::new(seq));
    }
    session.on_error(anyhow::anyhow!("archive segment unreadable"));
    // late records from a producer that has not noticed yet
    for seq in FAIL_AFTER..FAIL_AFTER + 10 {
        session.on_record(Packet::new(seq));
    }
    session.on_complete();

    let recorded = conn.recorded();
    assert!(!recorded.last_chunk);
    assert!(recorded.closed);
    let packets = decode_lines(&conn.chunked_payload());
    assert!(!packets.is_empty());
    assert!(packets.iter().all(|p| p.seq < FAIL_AFTER));

    assert!(producer.is_cancelled());
    assert!(session.is_failed());
    assert!(!session.is_finished());
    assert_eq!(session.stats().records, FAIL_AFTER);
    assert!(matches!(completion.outcome(), Some(Outcome::Failed(_))));
}

#[test]
fn test_stream_records_aborts_on_err_item() {
    let (mut session, conn, _) = session(
        JsonEncoder::<Packet>::new(),
        StreamOptions::default().threshold(256),
    );
    let items = (0..20u64).map(|seq| {
        if seq == 10 {
            Err(anyhow::anyhow!("replay interrupted"))
        } else {
            Ok(Packet::new(seq))
        }
    });
    let err = stream_records(&mut session, items).unwrap_err();
    assert!(matches!(err, StreamError::Producer(ref m) if m.contains("replay interrupted")));
    assert!(session.cancel_flag().is_cancelled());
    assert!(conn.is_closed());
    assert!(!conn.recorded().last_chunk);
    assert!(decode_lines(&conn.chunked_payload()).iter().all(|p| p.seq < 10));
}

#[test]
fn test_dropped_session_closes_the_connection() {
    let (mut session, conn, completion) =
        session(JsonEncoder::<Packet>::new(), StreamOptions::default());
    session.accept(&Packet::new(0)).unwrap();
    drop(session);
    assert!(conn.is_closed());
    assert!(!conn.recorded().last_chunk);
    assert!(matches!(completion.outcome(), Some(Outcome::Failed(m)) if m.contains("dropped")));
}

#[test]
fn test_unwritable_connection_pauses_the_producer() {
    let mut options = StreamOptions::default().threshold(512);
    options.check_interval = Duration::from_millis(20);
    let (mut session, conn, completion) = session(JsonEncoder::<Packet>::new(), options);
    conn.set_writable(false);

    let unblock = conn.clone();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        unblock.set_writable(true);
    });

    let started = Instant::now();
    for seq in 0..20 {
        session.accept(&Packet::new(seq)).unwrap();
    }
    let paused = started.elapsed();
    session.finish().unwrap();
    waker.join().unwrap();

    assert!(paused >= Duration::from_millis(100), "producer never paused: {paused:?}");
    assert!(conn.recorded().writable_waits >= 1);
    assert_eq!(decode_lines(&conn.chunked_payload()).len(), 20);
    assert_eq!(completion.outcome(), Some(&Outcome::Sent));
}

#[test]
fn test_peer_close_fails_the_session() {
    let mut options = StreamOptions::default().threshold(256);
    options.check_interval = Duration::from_millis(10);
    let (mut session, conn, completion) = session(JsonEncoder::<Packet>::new(), options);
    let producer = CancelFlag::new();
    session.set_producer(Box::new(producer.clone()));

    session.accept(&Packet::new(0)).unwrap();
    conn.close_peer();

    let mut result = Ok(());
    for seq in 1..50 {
        result = session.accept(&Packet::new(seq));
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(StreamError::PeerClosed)));
    assert!(session.is_failed());
    assert!(producer.is_cancelled());
    assert!(matches!(completion.outcome(), Some(Outcome::Failed(_))));
}

#[test]
fn test_peer_close_while_waiting_for_drain() {
    let mut options = StreamOptions::default().threshold(128);
    options.check_interval = Duration::from_millis(10);
    let (mut session, conn, _) = session(JsonEncoder::<Packet>::new(), options);
    conn.set_writable(false);

    let closer = conn.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        closer.close_peer();
    });
    let result = session.accept(&Packet::new(0)).and_then(|()| session.accept(&Packet::new(1)));
    handle.join().unwrap();
    assert!(matches!(result, Err(StreamError::PeerClosed)));
    assert!(conn.recorded().chunks.is_empty());
}

#[test]
fn test_content_disposition_names_the_attachment() {
    let (mut session, conn, _) = session(
        CsvEncoder::<Packet>::new(None),
        StreamOptions::default().filename("tm \"dump\".tsv"),
    );
    session.finish().unwrap();
    assert_eq!(
        conn.header("content-disposition").as_deref(),
        Some("attachment; filename=\"tm dump.tsv\"")
    );
    assert_eq!(conn.header("content-type").as_deref(), Some("text/csv"));
}

#[test]
fn test_csv_header_is_written_once() {
    let (mut session, conn, _) = session(
        CsvEncoder::<Packet>::new(Some(vec!["seq".into(), "name".into()])),
        StreamOptions::default().threshold(64),
    );
    for seq in 0..5 {
        session.accept(&Packet::new(seq)).unwrap();
    }
    session.finish().unwrap();
    let text = String::from_utf8(conn.chunked_payload()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "seq\tname");
    assert!(lines[1].starts_with("0\t/YSS/SIMULATOR/"));
}

#[test]
fn test_binary_records_are_length_delimited() {
    let (mut session, conn, _) = session(
        BinaryEncoder::<SampleRecord>::new(),
        StreamOptions::default().threshold(100),
    );
    for seq in 0..100 {
        session
            .accept(&SampleRecord {
                seq,
                generation_time_ms: 1_700_000_000_000 + seq as i64,
                value: seq as f64 * 0.5,
            })
            .unwrap();
    }
    session.finish().unwrap();
    assert_eq!(
        conn.header("content-type").as_deref(),
        Some("application/protobuf")
    );

    let payload = conn.chunked_payload();
    let mut cursor = payload.as_slice();
    let mut decoded = Vec::new();
    while !cursor.is_empty() {
        decoded.push(SampleRecord::decode_length_delimited(&mut cursor).unwrap());
    }
    assert_eq!(decoded.len(), 100);
    assert_eq!(decoded[42].seq, 42);
    assert!((decoded[42].value - 21.0).abs() < f64::EPSILON);
}

#[test]
fn test_sample_route_streams_negotiated_encoding() {
    let table = RouteTable::new();
    table
        .register_batch(Some("sim"), InstanceHandlers.routes())
        .unwrap();
    let dispatcher = dispatcher();
    let conn = RecordingConnection::new();
    let mut route_match = resolve(&table, &Method::GET, "/api/archive/sim/samples");
    route_match
        .query_params
        .push((std::sync::Arc::from("count"), "2500".to_string()));
    let completion = dispatcher.dispatch(
        route_match,
        incoming(
            Method::GET,
            "/api/archive/sim/samples",
            &[("accept", "text/csv")],
            BodySource::Empty,
            &conn,
        ),
    );
    assert!(completion.wait_timeout(Duration::from_secs(10)));
    assert_eq!(completion.outcome(), Some(&Outcome::Sent));
    assert_eq!(conn.header("content-type").as_deref(), Some("text/csv"));
    assert_eq!(
        conn.header("content-disposition").as_deref(),
        Some("attachment; filename=\"samples\"")
    );
    let text = String::from_utf8(conn.chunked_payload()).unwrap();
    assert_eq!(text.lines().count(), 2501);
    assert_eq!(text.lines().next(), Some("seq\tgeneration_time_ms\tvalue"));
}

//! Handlers served by the `mcs-gateway` binary on top of the built-in
//! health and overview routes.
//!
//! Real deployments register their own providers through
//! [`ApiService::register_handlers`](crate::server::ApiService::register_handlers);
//! these exist so a bare gateway has something instance-scoped to route to
//! and a streaming endpoint to point clients at.

use crate::error::ApiError;
use crate::router::{RouteProvider, RouteRule};
use crate::streaming::{stream_records, CsvRecord, FormatEncoder};
use http::StatusCode;
use serde::Serialize;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Upper bound of the `count` parameter of the sample stream.
pub const MAX_SAMPLE_RECORDS: u64 = 1_000_000;

const DEFAULT_SAMPLE_RECORDS: u64 = 1_000;

/// One row of the sample stream, in all three encodings.
#[derive(Clone, PartialEq, prost::Message, Serialize)]
pub struct SampleRecord {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(int64, tag = "2")]
    pub generation_time_ms: i64,
    #[prost(double, tag = "3")]
    pub value: f64,
}

impl CsvRecord for SampleRecord {
    fn csv_fields(&self) -> Vec<String> {
        vec![
            self.seq.to_string(),
            self.generation_time_ms.to_string(),
            self.value.to_string(),
        ]
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Instance-scoped routes; register with
/// [`ApiService::register_instance`](crate::server::ApiService::register_instance).
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceHandlers;

impl RouteProvider for InstanceHandlers {
    fn routes(&self) -> Vec<RouteRule> {
        vec![
            RouteRule::get("/api/instances/:instance", |req| {
                let instance = req.path_param("instance")?.to_string();
                req.respond_json(
                    StatusCode::OK,
                    &json!({ "name": instance, "time_ms": now_ms() }),
                )
            })
            .named("get_instance"),
            RouteRule::get("/api/archive/:instance/samples", |req| {
                let count = req
                    .query_param_as::<u64>("count")?
                    .unwrap_or(DEFAULT_SAMPLE_RECORDS);
                if count > MAX_SAMPLE_RECORDS {
                    return Err(ApiError::bad_request(format!(
                        "count too big, maximum allowed is {MAX_SAMPLE_RECORDS}"
                    )));
                }
                let encoding = req.negotiate_encoding();
                let header = ["seq", "generation_time_ms", "value"]
                    .map(String::from)
                    .to_vec();
                let options = req.stream_options().filename("samples");
                let mut session =
                    req.start_chunked(FormatEncoder::for_encoding(encoding, Some(header)), options)?;

                let start = now_ms();
                let records = (0..count).map(|seq| {
                    Ok(SampleRecord {
                        seq,
                        generation_time_ms: start + i64::try_from(seq).unwrap_or(i64::MAX),
                        value: (seq as f64 / 100.0).sin(),
                    })
                });
                if let Err(e) = stream_records(&mut session, records) {
                    // the session already closed the connection
                    debug!(error = %e, "Sample stream aborted");
                }
                Ok(())
            })
            .off_thread()
            .named("list_samples"),
        ]
    }
}

//! # Streaming Module
//!
//! Chunked-transfer responses for result sets of unknown size (archived
//! packets, parameter history, events).
//!
//! ## Overview
//!
//! - [`ChunkedTransferSession`] buffers serialized records and writes them
//!   as chunks of at least the threshold size (8096 bytes by default), with
//!   bounded memory and backpressure against a slow client
//! - [`RecordEncoder`] is the only per-format piece: [`BinaryEncoder`]
//!   (length-delimited protobuf), [`JsonEncoder`] (one document per line),
//!   [`CsvEncoder`] (tab-separated text with optional header)
//! - [`Connection`] is the write side of the transport, implemented by the
//!   HTTP server and by the in-memory recorder used in tests
//!
//! ## Lifecycle
//!
//! ```text
//! start ──► accept* ──► finish        (last data chunk, zero-length chunk, close)
//!              │
//!              └──► fail              (cancel producer, close, no error body)
//! ```
//!
//! Once `start` returns the response status is `200` for good. Anything
//! that goes wrong afterwards is a [`StreamError`] and closes the
//! connection.
//!
//! ## Example
//!
//! ```rust,ignore
//! let encoder = JsonEncoder::<PacketSummary>::new();
//! let mut session = req.start_chunked(encoder, req.stream_options().filename("packets.json"))?;
//! stream_records(&mut session, archive.packets(filter).map(|p| p.map(PacketSummary::from)))
//!     .ok();
//! ```

mod connection;
mod encoding;
mod producer;
mod session;

pub use connection::{BodyFraming, Connection, ResponseHead};
pub use encoding::{
    BinaryEncoder, CsvEncoder, CsvRecord, Encoding, FormatEncoder, JsonEncoder, RecordEncoder,
};
pub use producer::{stream_records, CancelFlag, Cancellable, RecordListener};
pub use session::{
    ChunkedTransferSession, StreamError, StreamOptions, StreamingConfig, TransferStats,
    DEFAULT_CHUNK_THRESHOLD, WRITABILITY_CHECK_INTERVAL,
};

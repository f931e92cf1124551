use super::connection::{BodyFraming, Connection, ResponseHead};
use super::encoding::RecordEncoder;
use super::producer::{CancelFlag, Cancellable};
use crate::dispatcher::{Completion, Responder};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Buffered bytes that trigger a flush.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 8096;

/// Longest single wait for the connection to drain before re-checking.
pub const WRITABILITY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Failures after the chunked preamble was sent. None of these can become
/// an HTTP error response any more; they close the connection.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("i/o error while streaming: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("stream already terminated")]
    Aborted,

    #[error("record producer failed: {0}")]
    Producer(String),
}

/// Streaming section of the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub chunk_threshold: usize,
    pub writability_check_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            writability_check_ms: WRITABILITY_CHECK_INTERVAL.as_millis() as u64,
        }
    }
}

/// Per-session knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub threshold: usize,
    pub check_interval: Duration,
    /// Sent as `Content-Disposition: attachment; filename="..."`.
    pub filename: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default())
    }
}

impl StreamOptions {
    #[must_use]
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            threshold: config.chunk_threshold.max(1),
            check_interval: Duration::from_millis(config.writability_check_ms.max(1)),
            filename: None,
        }
    }

    #[must_use]
    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    #[must_use]
    pub fn threshold(mut self, bytes: usize) -> Self {
        self.threshold = bytes.max(1);
        self
    }
}

/// Cumulative counters of one chunked transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    /// Payload bytes handed to the transport (chunk framing excluded)
    pub total_bytes: u64,
    /// Data chunks written (the terminating chunk excluded)
    pub chunk_count: u64,
    pub records: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Failed,
}

/// Streams records of unknown total count as a chunked response.
///
/// Records are serialized into an in-memory buffer; once the buffer reaches
/// the threshold it is written as one chunk. While the connection is not
/// writable, [`flush`](Self::flush) blocks the producing side in bounded
/// waits (backpressure). [`finish`](Self::finish) writes the last data chunk
/// and the zero-length terminator. [`fail`](Self::fail) stops everything:
/// producer cancelled, connection closed, no further records accepted.
///
/// Dropping a session that was neither finished nor failed fails it.
pub struct ChunkedTransferSession<E: RecordEncoder> {
    conn: Box<dyn Connection>,
    completion: Completion,
    encoder: E,
    buf: Vec<u8>,
    threshold: usize,
    check_interval: Duration,
    stats: TransferStats,
    state: State,
    cancel: CancelFlag,
    producer: Option<Box<dyn Cancellable>>,
    started: Instant,
}

impl<E: RecordEncoder> ChunkedTransferSession<E> {
    /// Send the `200 OK` chunked preamble. From here on the status is fixed.
    pub fn start(responder: Responder, mut encoder: E, options: StreamOptions) -> Result<Self, StreamError> {
        let (mut conn, completion) = responder.into_parts();

        let mut head = ResponseHead::new(StatusCode::OK, BodyFraming::Chunked);
        head.set_header("content-type", encoder.content_type());
        if let Some(filename) = &options.filename {
            head.set_header(
                "content-disposition",
                format!("attachment; filename=\"{}\"", filename.replace('"', "")),
            );
        }

        let mut buf = Vec::with_capacity(options.threshold + options.threshold / 4);
        let begun = conn
            .write_head(&head)
            .and_then(|()| encoder.begin(&mut buf));
        if let Err(e) = begun {
            warn!(
                request_id = %completion.request_id(),
                error = %e,
                "Failed to start chunked transfer"
            );
            conn.close();
            completion.complete_err(e.to_string());
            return Err(StreamError::Io(e));
        }
        completion.set_status(StatusCode::OK.as_u16(), true);

        debug!(
            request_id = %completion.request_id(),
            content_type = encoder.content_type(),
            threshold = options.threshold,
            filename = options.filename.as_deref().unwrap_or("-"),
            "Chunked transfer started"
        );

        Ok(Self {
            conn,
            completion,
            encoder,
            buf,
            threshold: options.threshold,
            check_interval: options.check_interval,
            stats: TransferStats::default(),
            state: State::Open,
            cancel: CancelFlag::new(),
            producer: None,
            started: Instant::now(),
        })
    }

    /// Serialize one record; flushes when the buffer reaches the threshold.
    pub fn accept(&mut self, record: &E::Record) -> Result<(), StreamError> {
        if self.state != State::Open {
            return Err(StreamError::Aborted);
        }
        if let Err(e) = self.encoder.encode(record, &mut self.buf) {
            return Err(self.fail_with(StreamError::Io(e)));
        }
        self.stats.records += 1;
        if self.buf.len() >= self.threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Hand the buffered bytes to the connection as one chunk, waiting for
    /// it to drain first if needed. No-op on an empty buffer.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        if self.state != State::Open {
            return Err(StreamError::Aborted);
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.encoder.end_chunk(&mut self.buf) {
            return Err(self.fail_with(StreamError::Io(e)));
        }
        self.await_writable()?;

        let capacity = self.buf.capacity();
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(capacity));
        let len = chunk.len() as u64;
        if let Err(e) = self.conn.write_chunk(chunk) {
            return Err(self.fail_with(StreamError::Io(e)));
        }
        self.stats.total_bytes += len;
        self.stats.chunk_count += 1;
        self.completion.add_transferred(len);
        Ok(())
    }

    fn await_writable(&mut self) -> Result<(), StreamError> {
        let mut waited = Duration::ZERO;
        while !self.conn.is_writable() {
            if !self.conn.is_open() {
                return Err(self.fail_with(StreamError::PeerClosed));
            }
            let start = Instant::now();
            if !self.conn.wait_writable(self.check_interval) && self.conn.is_open() {
                waited += start.elapsed();
                warn!(
                    request_id = %self.completion.request_id(),
                    peer = self.conn.peer().as_deref().unwrap_or("-"),
                    waited_ms = waited.as_millis() as u64,
                    "Connection not writable, producer paused"
                );
            }
        }
        if !self.conn.is_open() {
            return Err(self.fail_with(StreamError::PeerClosed));
        }
        Ok(())
    }

    /// Flush what is left, write the terminating chunk and complete the
    /// request. The connection is closed afterwards.
    pub fn finish(&mut self) -> Result<TransferStats, StreamError> {
        if self.state != State::Open {
            return Err(StreamError::Aborted);
        }
        self.flush()?;
        if let Err(e) = self.conn.write_last_chunk() {
            return Err(self.fail_with(StreamError::Io(e)));
        }
        self.state = State::Finished;
        self.conn.close();
        self.completion.complete_ok();

        info!(
            request_id = %self.completion.request_id(),
            total_bytes = self.stats.total_bytes,
            chunk_count = self.stats.chunk_count,
            records = self.stats.records,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Chunked transfer complete"
        );
        Ok(self.stats)
    }

    /// Abort the transfer. Idempotent: only the first call has any effect.
    pub fn fail(&mut self, cause: StreamError) {
        if self.state != State::Open {
            return;
        }
        self.state = State::Failed;
        self.buf.clear();
        self.cancel.cancel();
        if let Some(producer) = &self.producer {
            producer.cancel();
        }
        self.conn.close();

        warn!(
            request_id = %self.completion.request_id(),
            error = %cause,
            total_bytes = self.stats.total_bytes,
            chunk_count = self.stats.chunk_count,
            records = self.stats.records,
            "Chunked transfer aborted"
        );
        self.completion.complete_err(cause.to_string());
    }

    fn fail_with(&mut self, cause: StreamError) -> StreamError {
        let reported = match &cause {
            StreamError::Io(e) => StreamError::Io(io::Error::new(e.kind(), e.to_string())),
            StreamError::PeerClosed => StreamError::PeerClosed,
            StreamError::Aborted => StreamError::Aborted,
            StreamError::Producer(m) => StreamError::Producer(m.clone()),
        };
        self.fail(cause);
        reported
    }

    /// Register the upstream producer so a failure can stop it.
    pub fn set_producer(&mut self, producer: Box<dyn Cancellable>) {
        if self.state == State::Failed {
            producer.cancel();
        }
        self.producer = Some(producer);
    }

    /// Flag set when the session fails; producers may poll it.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    #[must_use]
    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Bytes waiting in the buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn completion(&self) -> &Completion {
        &self.completion
    }
}

impl<E: RecordEncoder> Drop for ChunkedTransferSession<E> {
    fn drop(&mut self) {
        if self.state == State::Open {
            self.fail(StreamError::Producer(
                "session dropped before completion".to_string(),
            ));
        }
    }
}

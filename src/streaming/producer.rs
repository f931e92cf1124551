use super::encoding::RecordEncoder;
use super::session::{ChunkedTransferSession, StreamError, TransferStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Something upstream that can be told to stop producing.
pub trait Cancellable: Send {
    fn cancel(&self);
}

/// Shared stop flag between a session and its producer.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Cancellable for CancelFlag {
    fn cancel(&self) {
        CancelFlag::cancel(self);
    }
}

/// Callback side of a push producer (archive query, replay).
///
/// A producer calls `on_record` zero or more times, then exactly one of
/// `on_complete` or `on_error`.
pub trait RecordListener<R> {
    fn on_record(&mut self, record: R);
    fn on_complete(&mut self);
    fn on_error(&mut self, cause: anyhow::Error);
}

impl<E: RecordEncoder> RecordListener<E::Record> for ChunkedTransferSession<E> {
    fn on_record(&mut self, record: E::Record) {
        // once failed the record is dropped unserialized
        if let Err(e) = self.accept(&record) {
            debug!(
                request_id = %self.completion().request_id(),
                error = %e,
                "Record dropped"
            );
        }
    }

    fn on_complete(&mut self) {
        if let Err(e) = self.finish() {
            debug!(
                request_id = %self.completion().request_id(),
                error = %e,
                "Transfer could not be finished"
            );
        }
    }

    fn on_error(&mut self, cause: anyhow::Error) {
        self.fail(StreamError::Producer(format!("{cause:#}")));
    }
}

/// Drive a session from a pull-style producer: every item is accepted in
/// order, an `Err` item aborts the transfer, exhaustion finishes it.
///
/// Stops pulling as soon as the session fails, so a dead client stops the
/// underlying query too.
pub fn stream_records<E, I>(
    session: &mut ChunkedTransferSession<E>,
    records: I,
) -> Result<TransferStats, StreamError>
where
    E: RecordEncoder,
    I: IntoIterator<Item = Result<E::Record, anyhow::Error>>,
{
    for item in records {
        match item {
            Ok(record) => session.accept(&record)?,
            Err(cause) => {
                let message = format!("{cause:#}");
                session.fail(StreamError::Producer(message.clone()));
                return Err(StreamError::Producer(message));
            }
        }
    }
    session.finish()
}

use crate::ids::RequestId;
use may::sync::mpsc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

/// Final state of a request, as seen by the transport and the watchdogs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A response was fully written.
    Sent,
    /// The request ended abnormally; the message is for logs only.
    Failed(String),
}

struct Inner {
    request_id: RequestId,
    outcome: OnceLock<Outcome>,
    status: AtomicU16,
    chunked: AtomicBool,
    transferred: AtomicU64,
    waiters: Mutex<Vec<mpsc::Sender<()>>>,
}

/// Per-request completion handle.
///
/// Cloned freely between the connection coroutine, the dispatcher
/// watchdogs and whatever ends up writing the response. Completes exactly
/// once; later calls are ignored.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("request_id", &self.inner.request_id)
            .field("outcome", &self.inner.outcome.get())
            .field("status", &self.status())
            .field("transferred", &self.transferred())
            .finish()
    }
}

impl Completion {
    #[must_use]
    pub fn new(request_id: RequestId) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_id,
                outcome: OnceLock::new(),
                status: AtomicU16::new(0),
                chunked: AtomicBool::new(false),
                transferred: AtomicU64::new(0),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    /// Record the committed status line. Called once the head is written.
    pub fn set_status(&self, status: u16, chunked: bool) {
        self.inner.status.store(status, Ordering::Release);
        self.inner.chunked.store(chunked, Ordering::Release);
    }

    /// Committed status, `None` while nothing was written.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self.inner.status.load(Ordering::Acquire) {
            0 => None,
            s => Some(s),
        }
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.inner.chunked.load(Ordering::Acquire)
    }

    pub fn add_transferred(&self, bytes: u64) {
        self.inner.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Body bytes handed to the transport so far.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::Relaxed)
    }

    pub fn complete_ok(&self) {
        self.complete(Outcome::Sent);
    }

    pub fn complete_err(&self, reason: impl Into<String>) {
        self.complete(Outcome::Failed(reason.into()));
    }

    fn complete(&self, outcome: Outcome) {
        if self.inner.outcome.set(outcome).is_err() {
            return;
        }
        let waiters = std::mem::take(
            &mut *self
                .inner
                .waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for tx in waiters {
            let _ = tx.send(());
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.inner.outcome.get()
    }

    /// A receiver that yields once the request completes (immediately if it
    /// already has).
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        let mut waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_done() {
            let _ = tx.send(());
        } else {
            waiters.push(tx);
        }
        rx
    }

    /// Wait up to `timeout`; true if the request completed.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.is_done() || self.subscribe().recv_timeout(timeout).is_ok()
    }

    /// Wait without bound.
    pub fn wait(&self) -> Option<&Outcome> {
        if !self.is_done() {
            let _ = self.subscribe().recv();
        }
        self.outcome()
    }
}

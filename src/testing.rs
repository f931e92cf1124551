//! In-memory doubles for the two seams of the crate: the client
//! [`Connection`] and the [`DistributionFeed`].
//!
//! Used by the crate's own tests and available to handler crates for
//! theirs.

use crate::collect::{DistributionFeed, FeedConsumer, FeedError, Keyed};
use crate::ids::SubscriptionId;
use crate::streaming::{Connection, ResponseHead};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Everything written to a [`RecordingConnection`].
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub head: Option<ResponseHead>,
    pub heads_written: usize,
    /// Fixed-length body bytes
    pub body: Vec<u8>,
    /// Data chunks, in order
    pub chunks: Vec<Vec<u8>>,
    pub last_chunk: bool,
    pub continues: usize,
    pub closed: bool,
    pub peer_closed: bool,
    pub writable: bool,
    pub writable_waits: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<Recorded>,
    changed: Condvar,
}

/// A [`Connection`] that records instead of sending.
///
/// Clones share the recording, so a test keeps one clone and hands the other
/// to the code under test. Writability and the peer going away can be
/// switched from the test at any time.
#[derive(Clone)]
pub struct RecordingConnection {
    shared: Arc<Shared>,
}

impl Default for RecordingConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingConnection {
    #[must_use]
    pub fn new() -> Self {
        let shared = Shared::default();
        shared.lock().writable = true;
        Self {
            shared: Arc::new(shared),
        }
    }

    #[must_use]
    pub fn boxed(&self) -> Box<dyn Connection> {
        Box::new(self.clone())
    }

    /// Snapshot of what was written so far.
    #[must_use]
    pub fn recorded(&self) -> Recorded {
        self.shared.lock().clone()
    }

    pub fn set_writable(&self, writable: bool) {
        self.shared.lock().writable = writable;
        self.shared.changed.notify_all();
    }

    /// Simulate the client going away.
    pub fn close_peer(&self) {
        self.shared.lock().peer_closed = true;
        self.shared.changed.notify_all();
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.shared
            .lock()
            .head
            .as_ref()
            .map(|h| h.status.as_u16())
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.shared
            .lock()
            .head
            .as_ref()
            .and_then(|h| h.header(name).map(str::to_string))
    }

    #[must_use]
    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.shared.lock().body).ok()
    }

    /// All chunk payloads joined.
    #[must_use]
    pub fn chunked_payload(&self) -> Vec<u8> {
        self.shared.lock().chunks.concat()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn writable_state(&self) -> Result<MutexGuard<'_, Recorded>, io::Error> {
        let state = self.shared.lock();
        if state.closed || state.peer_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection is closed",
            ));
        }
        Ok(state)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connection for RecordingConnection {
    fn write_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        let mut state = self.writable_state()?;
        state.heads_written += 1;
        if state.head.is_some() {
            return Err(io::Error::other("response head already written"));
        }
        state.head = Some(head.clone());
        Ok(())
    }

    fn write_body(&mut self, body: &[u8]) -> io::Result<()> {
        self.writable_state()?.body.extend_from_slice(body);
        Ok(())
    }

    fn write_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.writable_state()?.chunks.push(chunk);
        Ok(())
    }

    fn write_last_chunk(&mut self) -> io::Result<()> {
        self.writable_state()?.last_chunk = true;
        Ok(())
    }

    fn send_continue(&mut self) -> io::Result<()> {
        self.writable_state()?.continues += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.shared.lock();
        !state.closed && !state.peer_closed
    }

    fn is_writable(&self) -> bool {
        let state = self.shared.lock();
        !state.closed && !state.peer_closed && state.writable
    }

    fn wait_writable(&mut self, timeout: Duration) -> bool {
        let mut state = self.shared.lock();
        state.writable_waits += 1;
        let deadline = Instant::now() + timeout;
        while !state.writable && !state.closed && !state.peer_closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        !state.closed && !state.peer_closed && state.writable
    }

    fn close(&mut self) {
        self.shared.lock().closed = true;
        self.shared.changed.notify_all();
    }

    fn peer(&self) -> Option<String> {
        Some("recording".to_string())
    }
}

/// A [`DistributionFeed`] that replays a fixed script.
///
/// After each successful subscribe, a background thread delivers every
/// scripted batch at its offset, restricted to the identifiers of that
/// subscription, until the subscription is released.
pub struct ScriptedFeed<T: Keyed + Clone + Sync> {
    known: Option<HashSet<T::Key>>,
    script: Vec<(Duration, Vec<T>)>,
    cache: HashMap<T::Key, T>,
    forbidden: Option<String>,
    active: Arc<Mutex<HashMap<SubscriptionId, FeedConsumer<T>>>>,
    opened: AtomicUsize,
    subscribed: AtomicUsize,
    unsubscribed: AtomicUsize,
}

impl<T: Keyed + Clone + Sync> Default for ScriptedFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed + Clone + Sync> ScriptedFeed<T> {
    /// A feed that knows every identifier and never delivers anything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            known: None,
            script: Vec::new(),
            cache: HashMap::new(),
            forbidden: None,
            active: Arc::new(Mutex::new(HashMap::new())),
            opened: AtomicUsize::new(0),
            subscribed: AtomicUsize::new(0),
            unsubscribed: AtomicUsize::new(0),
        }
    }

    /// Deliver `batch` this long after subscribing.
    #[must_use]
    pub fn deliver_after(mut self, delay: Duration, batch: Vec<T>) -> Self {
        self.script.push((delay, batch));
        self.script.sort_by_key(|(d, _)| *d);
        self
    }

    /// Only these identifiers exist; subscribing to anything else is rejected.
    #[must_use]
    pub fn known(mut self, ids: impl IntoIterator<Item = T::Key>) -> Self {
        self.known = Some(ids.into_iter().collect());
        self
    }

    #[must_use]
    pub fn cached_value(mut self, item: T) -> Self {
        self.cache.insert(item.key().clone(), item);
        self
    }

    /// Refuse every subscription with this message.
    #[must_use]
    pub fn forbid(mut self, message: &str) -> Self {
        self.forbidden = Some(message.to_string());
        self
    }

    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribed(&self) -> usize {
        self.subscribed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn unsubscribed(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    /// Subscriptions opened and not released yet.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check_known(&self, ids: &[T::Key]) -> Result<(), FeedError> {
        let Some(known) = &self.known else {
            return Ok(());
        };
        let unknown: Vec<String> = ids
            .iter()
            .filter(|id| !known.contains(*id))
            .map(ToString::to_string)
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(FeedError::Rejected { unknown })
        }
    }
}

impl<T: Keyed + Clone + Sync> DistributionFeed<T> for ScriptedFeed<T> {
    fn open(&self, consumer: FeedConsumer<T>) -> Result<SubscriptionId, FeedError> {
        let sub = SubscriptionId::next();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sub, consumer);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(sub)
    }

    fn subscribe(&self, sub: SubscriptionId, ids: &[T::Key]) -> Result<(), FeedError> {
        if let Some(message) = &self.forbidden {
            return Err(FeedError::Forbidden(message.clone()));
        }
        self.check_known(ids)?;
        self.subscribed.fetch_add(1, Ordering::SeqCst);

        let wanted: HashSet<T::Key> = ids.iter().cloned().collect();
        let script = self.script.clone();
        let active = Arc::clone(&self.active);
        let started = Instant::now();
        thread::spawn(move || {
            for (delay, batch) in script {
                thread::sleep(delay.saturating_sub(started.elapsed()));
                let consumer = active
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&sub)
                    .cloned();
                let Some(consumer) = consumer else {
                    return;
                };
                let batch: Vec<T> = batch
                    .into_iter()
                    .filter(|item| wanted.contains(item.key()))
                    .collect();
                if !consumer.deliver(batch) {
                    return;
                }
            }
        });
        Ok(())
    }

    fn unsubscribe(&self, sub: SubscriptionId) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sub);
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }

    fn cached(&self, ids: &[T::Key]) -> Result<Vec<T>, FeedError> {
        if let Some(message) = &self.forbidden {
            return Err(FeedError::Forbidden(message.clone()));
        }
        self.check_known(ids)?;
        Ok(ids.iter().filter_map(|id| self.cache.get(id).cloned()).collect())
    }
}

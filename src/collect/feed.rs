use crate::ids::SubscriptionId;
use may::sync::mpsc;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use thiserror::Error;

/// A value identified by a key (parameter name, alarm id, ...).
pub trait Keyed: Send + 'static {
    type Key: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;

    fn key(&self) -> &Self::Key;
}

/// Hand-off side given to a feed: batches pushed here reach exactly one
/// collecting caller.
pub struct FeedConsumer<T> {
    tx: mpsc::Sender<Vec<T>>,
}

impl<T> Clone for FeedConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> FeedConsumer<T> {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Vec<T>>) -> Self {
        Self { tx }
    }

    /// Push one batch. Returns false once the collector has gone away, so
    /// the feed can drop the subscription on its side.
    pub fn deliver(&self, batch: Vec<T>) -> bool {
        if batch.is_empty() {
            return true;
        }
        self.tx.send(batch).is_ok()
    }
}

/// Synchronous failures reported by a distribution feed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("unknown identifiers: {}", unknown.join(", "))]
    Rejected { unknown: Vec<String> },

    #[error("{0}")]
    Forbidden(String),

    #[error("distribution feed unavailable: {0}")]
    Unavailable(String),
}

/// Publish/subscribe source of live values.
///
/// A subscription is opened empty, then scoped to identifiers. Splitting the
/// two lets the caller release a subscription whose identifiers were
/// rejected. Implementations deliver batches asynchronously, from any
/// thread, through the [`FeedConsumer`] passed to [`open`](Self::open).
pub trait DistributionFeed<T: Keyed>: Send + Sync {
    fn open(&self, consumer: FeedConsumer<T>) -> Result<SubscriptionId, FeedError>;

    /// Add identifiers to a subscription. Any unknown identifier rejects the
    /// whole call.
    fn subscribe(&self, sub: SubscriptionId, ids: &[T::Key]) -> Result<(), FeedError>;

    fn unsubscribe(&self, sub: SubscriptionId);

    /// Values currently cached for `ids`, without subscribing or waiting.
    /// Identifiers with nothing cached are simply absent from the result.
    fn cached(&self, ids: &[T::Key]) -> Result<Vec<T>, FeedError>;
}

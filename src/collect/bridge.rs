use super::feed::{DistributionFeed, FeedConsumer, FeedError, Keyed};
use crate::dispatcher::ApiRequest;
use crate::error::ApiError;
use crate::ids::SubscriptionId;
use may::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Timeout used when the caller does not give one.
pub const DEFAULT_COLLECTION_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Upper bound on a caller-supplied timeout.
pub const MAX_COLLECTION_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Collection section of the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_COLLECTION_TIMEOUT.as_millis() as u64,
            max_timeout_ms: MAX_COLLECTION_TIMEOUT.as_millis() as u64,
        }
    }
}

/// How a collection ended. Running out of time is an expected outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome<K> {
    /// Every requested identifier delivered a value.
    Complete,
    /// The deadline passed first; these identifiers never delivered.
    TimedOut { missing: Vec<K> },
}

#[derive(Debug)]
pub struct Collected<T: Keyed> {
    /// Latest value per identifier, in order of first arrival
    pub items: Vec<T>,
    pub outcome: CollectOutcome<T::Key>,
    pub elapsed: Duration,
}

impl<T: Keyed> Collected<T> {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, CollectOutcome::Complete)
    }
}

/// Releases the subscription when the collection call unwinds, whatever
/// the exit path.
struct SubscriptionGuard<'a, T: Keyed> {
    feed: &'a dyn DistributionFeed<T>,
    sub: SubscriptionId,
}

impl<T: Keyed> Drop for SubscriptionGuard<'_, T> {
    fn drop(&mut self) {
        self.feed.unsubscribe(self.sub);
        debug!(subscription = %self.sub, "Collection subscription released");
    }
}

/// Turns a push-based feed into a deadline-bounded synchronous call.
///
/// [`collect`](Self::collect) blocks its caller on a channel with timed
/// waits, so it belongs on off-thread routes, never on the connection
/// coroutine.
pub struct BoundedCollectionBridge<T: Keyed> {
    feed: Arc<dyn DistributionFeed<T>>,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl<T: Keyed> Clone for BoundedCollectionBridge<T> {
    fn clone(&self) -> Self {
        Self {
            feed: Arc::clone(&self.feed),
            default_timeout: self.default_timeout,
            max_timeout: self.max_timeout,
        }
    }
}

impl<T: Keyed> BoundedCollectionBridge<T> {
    pub fn new(feed: Arc<dyn DistributionFeed<T>>) -> Self {
        Self::with_config(feed, &CollectionConfig::default())
    }

    pub fn with_config(feed: Arc<dyn DistributionFeed<T>>, config: &CollectionConfig) -> Self {
        Self {
            feed,
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            max_timeout: Duration::from_millis(config.max_timeout_ms),
        }
    }

    /// Timeout from the `timeout` query parameter (milliseconds), or the
    /// configured default.
    pub fn timeout_from_request(&self, req: &ApiRequest) -> Result<Duration, ApiError> {
        Ok(req
            .query_param_as::<u64>("timeout")?
            .map_or(self.default_timeout, Duration::from_millis))
    }

    /// Wait up to `timeout` for a value of every identifier in `ids`.
    ///
    /// Returns as soon as all identifiers delivered, or when the deadline
    /// passes with whatever arrived. Fails fast if the feed rejects an
    /// identifier. The subscription is released exactly once on every path.
    pub fn collect(&self, ids: &[T::Key], timeout: Duration) -> Result<Collected<T>, ApiError> {
        if timeout > self.max_timeout {
            return Err(ApiError::bad_request(format!(
                "timeout too big, maximum allowed is {} ms",
                self.max_timeout.as_millis()
            )));
        }
        let started = Instant::now();
        let deadline = started + timeout;

        let requested: HashSet<T::Key> = ids.iter().cloned().collect();
        let mut pending = requested.clone();
        let mut items: Vec<T> = Vec::with_capacity(requested.len());
        if pending.is_empty() {
            return Ok(Collected {
                items,
                outcome: CollectOutcome::Complete,
                elapsed: started.elapsed(),
            });
        }

        let (tx, rx) = mpsc::channel();
        let sub = self.feed.open(FeedConsumer::new(tx)).map_err(feed_error)?;
        let _guard = SubscriptionGuard {
            feed: self.feed.as_ref(),
            sub,
        };
        self.feed.subscribe(sub, ids).map_err(|e| {
            debug!(subscription = %sub, error = %e, "Collection rejected by feed");
            feed_error(e)
        })?;

        debug!(
            subscription = %sub,
            requested = requested.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Collecting values"
        );

        let mut position: HashMap<T::Key, usize> = HashMap::with_capacity(requested.len());
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(batch) => {
                    for item in batch {
                        let key = item.key().clone();
                        if !requested.contains(&key) {
                            continue;
                        }
                        pending.remove(&key);
                        match position.get(&key) {
                            Some(&idx) => items[idx] = item,
                            None => {
                                position.insert(key, items.len());
                                items.push(item);
                            }
                        }
                    }
                    if pending.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(subscription = %sub, "Feed dropped the subscription before the deadline");
                    break;
                }
            }
        }

        let elapsed = started.elapsed();
        let outcome = if pending.is_empty() {
            CollectOutcome::Complete
        } else {
            // requested order, not hash order
            let missing = ids
                .iter()
                .filter(|k| pending.remove(*k))
                .cloned()
                .collect();
            CollectOutcome::TimedOut { missing }
        };
        debug!(
            subscription = %sub,
            received = items.len(),
            complete = matches!(outcome, CollectOutcome::Complete),
            elapsed_ms = elapsed.as_millis() as u64,
            "Collection finished"
        );
        Ok(Collected {
            items,
            outcome,
            elapsed,
        })
    }

    /// Only what the feed has cached right now. Never subscribes, never waits.
    pub fn cached(&self, ids: &[T::Key]) -> Result<Vec<T>, ApiError> {
        self.feed.cached(ids).map_err(feed_error)
    }
}

fn feed_error(err: FeedError) -> ApiError {
    match err {
        FeedError::Rejected { unknown } => ApiError::CollectionRejected { unknown },
        FeedError::Forbidden(msg) => ApiError::Forbidden(msg),
        FeedError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
    }
}

//! # Collect Module
//!
//! Bounded collection of live values from an asynchronous distribution feed.
//!
//! A synchronous handler asks for "the values of these identifiers, now or
//! within T milliseconds". [`BoundedCollectionBridge::collect`] opens a
//! subscription scoped to those identifiers, waits on a single-consumer
//! channel until every identifier delivered or the deadline passed, and
//! releases the subscription on the way out, always exactly once.
//!
//! | situation                         | result                                   |
//! |-----------------------------------|------------------------------------------|
//! | everything arrived                | `Ok`, [`CollectOutcome::Complete`], early |
//! | deadline passed                   | `Ok`, [`CollectOutcome::TimedOut`]        |
//! | feed rejects an identifier        | `Err(ApiError::CollectionRejected)`       |
//! | feed refuses access               | `Err(ApiError::Forbidden)`                |
//! | timeout above the maximum (60 s)  | `Err(ApiError::BadRequest)`               |
//!
//! [`BoundedCollectionBridge::cached`] is the non-blocking variant: whatever
//! the feed has cached, no subscription.

mod bridge;
mod feed;

pub use bridge::{
    BoundedCollectionBridge, CollectOutcome, Collected, CollectionConfig,
    DEFAULT_COLLECTION_TIMEOUT, MAX_COLLECTION_TIMEOUT,
};
pub use feed::{DistributionFeed, FeedConsumer, FeedError, Keyed};

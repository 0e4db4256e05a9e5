//! Broker transport (component B): pub/sub + keyed K/V + lists + pipelines.
//!
//! The spec draws a trust boundary at the broker and treats it as the only
//! shared store (§5, §9 Non-goals: "assumes a single broker"). This module
//! defines the `Broker` trait that every other component programs against,
//! and [`memory`] provides the in-process implementation this crate ships
//! with — grounded on the teacher's actor/oneshot message-passing idiom in
//! `src/messages.rs`, generalized from a single command channel to the
//! pub/sub + key/value surface of spec §4.2. A real Redis-backed transport
//! would implement the same trait without touching any caller.

pub mod memory;

use async_trait::async_trait;

use crate::codec::Envelope;
use crate::error::TransportError;

/// One message delivered to a subscriber: the topic it arrived on and the
/// decoded envelope.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub envelope: Envelope,
}

/// A subscription handle. Polling this is how callers receive publishes;
/// the transport guarantees FIFO within one subscription but no ordering
/// across independently-subscribed channels (spec §4.2).
#[async_trait]
pub trait Subscription: Send {
    async fn recv(&mut self) -> Option<Delivery>;
}

/// Broker operations required by spec §4.2. Every write that other
/// services pull asynchronously uses `set_and_publish`, the dual-write
/// convention (`set <key>` + `publish <key>:sub`, atomically).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an envelope to `topic`. Per convention, topics are suffixed
    /// with `:sub` at the transport boundary, not by callers.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Subscribe to a single topic. Each connection delivers to one
    /// cooperative callback (here, one `Subscription`).
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError>;

    /// Subscribe to every topic matching a glob-style pattern
    /// (`public/<scanID>/file/*` and similar).
    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, TransportError>;

    /// Set a key's value without publishing.
    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Dual-write: set the key's value and publish to `<key>:sub`,
    /// pipelined so a late subscriber can always recover the last value.
    async fn set_and_publish(&self, key: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Get a key's last-set value, if any.
    async fn get(&self, key: &str) -> Result<Option<Envelope>, TransportError>;

    /// Push an envelope onto the left of a list key.
    async fn lpush(&self, key: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Push an envelope onto the right of a list key.
    async fn rpush(&self, key: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Read a range `[start, end]` (inclusive, 0-based) from a list key.
    async fn lrange(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<Envelope>, TransportError>;

    /// Append an envelope to a stream key (used for async device readbacks,
    /// spec §4.7).
    async fn stream_append(&self, key: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Read the full range of a stream key.
    async fn stream_range(&self, key: &str) -> Result<Vec<Envelope>, TransportError>;

    /// Enumerate every key matching a glob-style pattern (used to recover
    /// file references on `public/<scanID>/file/*`).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, TransportError>;

    /// Delete a key (and any list/stream storage under it).
    async fn delete(&self, key: &str) -> Result<(), TransportError>;
}

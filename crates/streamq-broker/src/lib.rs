//! Broker transport contract and its two implementations: an in-process
//! broker for tests and single-process deployments, and a Redis Streams
//! broker for distributed ones.

mod memory;
mod stream;

pub use memory::InMemoryBroker;
pub use stream::{RedisStreamBroker, RedisStreamConfig};

use async_trait::async_trait;
use std::time::Duration;
use streamq_core::{Envelope, Result};

/// Broker-assigned identifier for one queued message. Opaque, unique and
/// monotonically increasing within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        MessageId(id)
    }
}

/// One message handed to a consumer; stays in the group's pending-entry set
/// until acked, dead-lettered or reclaimed.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub envelope: Envelope,
}

/// Abstract transport: durable append, group-based consumption with
/// acknowledgment, and reclamation of stalled deliveries.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably append an envelope; safe to call concurrently from many
    /// publishers.
    async fn append(&self, queue: &str, envelope: &Envelope) -> Result<MessageId>;

    /// Fetch up to `max_count` new messages for `consumer` within `group`.
    /// Blocks up to `block_timeout` when nothing is ready, then returns an
    /// empty batch. Reconnect-capable implementations additionally replay
    /// this consumer's own unacknowledged deliveries on the first read after
    /// connecting; for the others, recovery goes through [`Broker::claim_stale`].
    async fn read(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Remove a delivery from the group's pending-entry set. Idempotent:
    /// acking an already-acked or unknown id is a no-op.
    async fn ack(&self, queue: &str, group: &str, id: &MessageId) -> Result<()>;

    /// Reset the idle clock on deliveries `consumer` is still working on, so
    /// a long-running handler is not mistaken for a crashed one by
    /// [`Broker::claim_stale`]. Ids not pending on this consumer are ignored.
    async fn touch(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        ids: &[MessageId],
    ) -> Result<()>;

    /// Reassign deliveries held unacknowledged for longer than
    /// `idle_threshold` to `new_consumer`. Recovers work from crashed
    /// consumers.
    async fn claim_stale(
        &self,
        queue: &str,
        group: &str,
        idle_threshold: Duration,
        new_consumer: &str,
    ) -> Result<Vec<Delivery>>;

    /// Append the envelope to the queue's dead-letter destination with the
    /// failure reason attached, and ack the original delivery.
    async fn dead_letter(
        &self,
        queue: &str,
        group: &str,
        id: &MessageId,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<()>;

    /// Release the transport. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

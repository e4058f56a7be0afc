use crate::{Broker, Delivery, MessageId};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::collections::HashSet;
use std::time::Duration;
use streamq_core::{Envelope, QueueError, Result};
use tracing::{debug, warn};

/// Stream field holding the encoded envelope frame.
const ENVELOPE_FIELD: &str = "envelope";
/// Stream field holding the failure reason on dead-letter entries.
const REASON_FIELD: &str = "reason";
/// Pending entries inspected per claim_stale call.
const CLAIM_PAGE: usize = 128;
/// Sleep between empty-read polls while waiting out `block_timeout`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Prefix for every stream key, so one Redis instance can host several
    /// deployments.
    pub key_prefix: String,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        RedisStreamConfig {
            key_prefix: "streamq".to_string(),
        }
    }
}

/// Broker over Redis Streams: `append` is XADD, group consumption is
/// XREADGROUP, acknowledgment is XACK, reclamation is XPENDING + XCLAIM.
///
/// The connection manager reconnects transparently, so transport failures
/// surface as retryable [`QueueError::BrokerUnavailable`] without touching
/// message state.
pub struct RedisStreamBroker {
    conn: ConnectionManager,
    config: RedisStreamConfig,
    /// (key, group) pairs already created on the server.
    ready_groups: Mutex<HashSet<(String, String)>>,
    /// (key, group, consumer) triples that have drained their own pending
    /// backlog since this process connected.
    replayed: Mutex<HashSet<(String, String, String)>>,
}

impl RedisStreamBroker {
    pub async fn connect(redis_url: &str, config: RedisStreamConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;
        Ok(Self::from_connection(conn, config))
    }

    /// Share an existing connection manager across components.
    pub fn from_connection(conn: ConnectionManager, config: RedisStreamConfig) -> Self {
        RedisStreamBroker {
            conn,
            config,
            ready_groups: Mutex::new(HashSet::new()),
            replayed: Mutex::new(HashSet::new()),
        }
    }

    fn queue_key(&self, queue: &str) -> String {
        stream_key(&self.config.key_prefix, queue)
    }

    fn dead_letter_key(&self, queue: &str) -> String {
        dead_letter_stream_key(&self.config.key_prefix, queue)
    }

    /// Create the consumer group if this process has not seen it yet.
    /// Bound to `$` so pre-existing history is not replayed to new groups.
    async fn ensure_group(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        group: &str,
    ) -> Result<()> {
        {
            let ready = self.ready_groups.lock();
            if ready.contains(&(key.to_string(), group.to_string())) {
                return Ok(());
            }
        }

        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(key, group, "$").await;
        match created {
            Ok(()) => debug!(key, group, "created consumer group"),
            // Another consumer won the race; the group already exists.
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(broker_err(e)),
        }

        self.ready_groups
            .lock()
            .insert((key.to_string(), group.to_string()));
        Ok(())
    }

    /// Turn raw stream entries into deliveries, dead-lettering frames this
    /// consumer cannot even parse.
    async fn collect(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        group: &str,
        entries: Vec<StreamId>,
    ) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = MessageId(entry.id.clone());
            let Some(bytes) = entry.get::<Vec<u8>>(ENVELOPE_FIELD) else {
                warn!(%id, "stream entry without envelope field");
                self.dead_letter_raw(conn, queue, group, &id, Vec::new(), "malformed envelope")
                    .await?;
                continue;
            };
            match Envelope::from_bytes(&bytes) {
                Ok(envelope) => deliveries.push(Delivery { id, envelope }),
                Err(e) => {
                    warn!(%id, error = %e, "dead-lettering unparseable envelope");
                    self.dead_letter_raw(conn, queue, group, &id, bytes, "malformed envelope")
                        .await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn dead_letter_raw(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        group: &str,
        id: &MessageId,
        envelope_bytes: Vec<u8>,
        reason: &str,
    ) -> Result<()> {
        let _: String = conn
            .xadd(
                self.dead_letter_key(queue),
                "*",
                &[
                    (ENVELOPE_FIELD, envelope_bytes),
                    (REASON_FIELD, reason.as_bytes().to_vec()),
                ],
            )
            .await
            .map_err(broker_err)?;
        let _: u64 = conn
            .xack(self.queue_key(queue), group, &[id.0.as_str()])
            .await
            .map_err(broker_err)?;
        Ok(())
    }
}

/// Logical queue name to backing stream key; injective by construction.
fn stream_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:{queue}")
}

fn dead_letter_stream_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:{queue}:dead-letter")
}

fn next_poll_delay(remaining: Duration) -> Duration {
    remaining.min(POLL_INTERVAL)
}

fn broker_err(e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        QueueError::BrokerUnavailable(e.to_string())
    } else {
        QueueError::Broker(e.to_string())
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn append(&self, queue: &str, envelope: &Envelope) -> Result<MessageId> {
        let bytes = envelope.to_bytes()?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(self.queue_key(queue), "*", &[(ENVELOPE_FIELD, bytes)])
            .await
            .map_err(broker_err)?;
        Ok(MessageId(id))
    }

    async fn read(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<Delivery>> {
        let key = self.queue_key(queue);
        let mut conn = self.conn.clone();
        self.ensure_group(&mut conn, &key, group).await?;

        // First read after connecting replays this consumer's own pending
        // entries, so deliveries lost to a crash are processed before new work.
        let needs_replay = {
            let replayed = self.replayed.lock();
            !replayed.contains(&(key.clone(), group.to_string(), consumer.to_string()))
        };
        if needs_replay {
            let options = StreamReadOptions::default()
                .group(group, consumer)
                .count(max_count);
            let reply: StreamReadReply = conn
                .xread_options(&[key.as_str()], &["0"], &options)
                .await
                .map_err(broker_err)?;
            self.replayed
                .lock()
                .insert((key.clone(), group.to_string(), consumer.to_string()));

            let entries: Vec<StreamId> = reply.keys.into_iter().flat_map(|k| k.ids).collect();
            if !entries.is_empty() {
                debug!(queue, consumer, count = entries.len(), "replaying own pending entries");
                let deliveries = self.collect(&mut conn, queue, group, entries).await?;
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
            }
        }

        // No BLOCK: a blocking read would hold the shared multiplexed
        // connection and stall every other command multiplexed onto it, so
        // empty reads wait out the timeout with a client-side poll instead.
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count);
        let deadline = tokio::time::Instant::now() + block_timeout;
        loop {
            let reply: StreamReadReply = conn
                .xread_options(&[key.as_str()], &[">"], &options)
                .await
                .map_err(broker_err)?;

            let entries: Vec<StreamId> = reply.keys.into_iter().flat_map(|k| k.ids).collect();
            if !entries.is_empty() {
                return self.collect(&mut conn, queue, group, entries).await;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(next_poll_delay(deadline - now)).await;
        }
    }

    async fn ack(&self, queue: &str, group: &str, id: &MessageId) -> Result<()> {
        let mut conn = self.conn.clone();
        // XACK of an unknown or already-acked id returns 0, never an error.
        let _: u64 = conn
            .xack(self.queue_key(queue), group, &[id.0.as_str()])
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn touch(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        ids: &[MessageId],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let key = self.queue_key(queue);
        let mut conn = self.conn.clone();

        // XCLAIM back to the same consumer with a zero min-idle-time resets
        // the entry's idle clock without changing ownership. Ids acked or
        // claimed away in the meantime drop out of the reply.
        let id_strs: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        let _: StreamClaimReply = conn
            .xclaim(&key, group, consumer, 0usize, &id_strs)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        queue: &str,
        group: &str,
        idle_threshold: Duration,
        new_consumer: &str,
    ) -> Result<Vec<Delivery>> {
        let key = self.queue_key(queue);
        let mut conn = self.conn.clone();
        self.ensure_group(&mut conn, &key, group).await?;

        let pending: StreamPendingCountReply = conn
            .xpending_count(&key, group, "-", "+", CLAIM_PAGE)
            .await
            .map_err(broker_err)?;

        let idle_ms = idle_threshold.as_millis() as usize;
        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|entry| entry.last_delivered_ms >= idle_ms)
            .map(|entry| entry.id)
            .collect();
        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks idle time server-side, so a racing ack or claim
        // by another worker simply drops out of the reply.
        let claimed: StreamClaimReply = conn
            .xclaim(&key, group, new_consumer, idle_ms, &stale_ids)
            .await
            .map_err(broker_err)?;

        debug!(queue, group, new_consumer, count = claimed.ids.len(), "claimed stale deliveries");
        self.collect(&mut conn, queue, group, claimed.ids).await
    }

    async fn dead_letter(
        &self,
        queue: &str,
        group: &str,
        id: &MessageId,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        let mut conn = self.conn.clone();
        self.dead_letter_raw(&mut conn, queue, group, id, bytes, reason)
            .await
    }

    async fn close(&self) -> Result<()> {
        // The connection manager owns no server-side state to release.
        Ok(())
    }
}

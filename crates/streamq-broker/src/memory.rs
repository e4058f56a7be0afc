use crate::{Broker, Delivery, MessageId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use streamq_core::{Envelope, QueueError, Result};
use tokio::sync::Notify;

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

struct GroupState {
    /// Next sequence number this group will deliver.
    cursor: u64,
    pending: HashMap<u64, PendingEntry>,
}

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<u64, Envelope>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
    /// Terminal destination; retained for the life of the broker so failures
    /// stay inspectable.
    dead: Vec<(Envelope, String)>,
}

impl QueueState {
    /// Drop entries every group has moved past and no group still holds
    /// pending. Queues without groups keep everything, since `entries` is
    /// the only record of what was appended.
    fn prune(&mut self) {
        let Some(min_cursor) = self.groups.values().map(|g| g.cursor).min() else {
            return;
        };
        let pending: HashSet<u64> = self
            .groups
            .values()
            .flat_map(|g| g.pending.keys().copied())
            .collect();
        self.entries
            .retain(|seq, _| *seq >= min_cursor || pending.contains(seq));
    }
}

/// Process-local broker keeping whole queues in memory.
///
/// Implements the full consumer-group contract (pending entries, idempotent
/// acks, idle-based reclamation), which makes it the broker of choice for
/// tests and single-process deployments. `read` returns new entries only;
/// there is no reconnect event here, so recovery of unacked deliveries goes
/// through `claim_stale` exclusively.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    appended: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            queues: Mutex::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    fn parse_id(id: &MessageId) -> Result<u64> {
        id.0.parse::<u64>()
            .map_err(|_| QueueError::Broker(format!("not an in-memory message id: {}", id.0)))
    }

    fn format_id(seq: u64) -> MessageId {
        // Zero-padded so ids sort lexically by arrival.
        MessageId(format!("{seq:016}"))
    }

    fn try_read(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Vec<Delivery> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        let tail = state.next_seq;

        // Groups are created lazily, cursored at the current tail so
        // pre-existing history is not replayed.
        let group_state = state.groups.entry(group.to_string()).or_insert(GroupState {
            cursor: tail,
            pending: HashMap::new(),
        });

        let seqs: Vec<u64> = state
            .entries
            .range(group_state.cursor..)
            .take(max_count)
            .map(|(seq, _)| *seq)
            .collect();

        let now = Instant::now();
        let mut deliveries = Vec::with_capacity(seqs.len());
        for seq in seqs {
            group_state.cursor = seq + 1;
            group_state.pending.insert(
                seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            if let Some(envelope) = state.entries.get(&seq) {
                deliveries.push(Delivery {
                    id: Self::format_id(seq),
                    envelope: envelope.clone(),
                });
            }
        }
        deliveries
    }

    /// Envelopes currently stored on a queue, in arrival order.
    pub fn entries(&self, queue: &str) -> Vec<(MessageId, Envelope)> {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .map(|(seq, envelope)| (Self::format_id(*seq), envelope.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dead-lettered envelopes for a queue, with their failure reasons.
    pub fn dead_letters(&self, queue: &str) -> Vec<(Envelope, String)> {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .map(|state| state.dead.clone())
            .unwrap_or_default()
    }

    /// Size of a group's pending-entry set.
    pub fn pending_len(&self, queue: &str, group: &str) -> usize {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .and_then(|state| state.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn append(&self, queue: &str, envelope: &Envelope) -> Result<MessageId> {
        let id = {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue.to_string()).or_default();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(seq, envelope.clone());
            Self::format_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + block_timeout;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking state, so an append that
            // races with the check is not missed.
            notified.as_mut().enable();

            let batch = self.try_read(queue, group, consumer, max_count);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, queue: &str, group: &str, id: &MessageId) -> Result<()> {
        let seq = Self::parse_id(id)?;
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(queue) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(&seq);
            }
            state.prune();
        }
        Ok(())
    }

    async fn touch(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        ids: &[MessageId],
    ) -> Result<()> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(());
        };

        let now = Instant::now();
        for id in ids {
            let seq = Self::parse_id(id)?;
            if let Some(entry) = group_state.pending.get_mut(&seq) {
                if entry.consumer == consumer {
                    entry.delivered_at = now;
                }
            }
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        queue: &str,
        group: &str,
        idle_threshold: Duration,
        new_consumer: &str,
    ) -> Result<Vec<Delivery>> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut stale: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.delivered_at) >= idle_threshold)
            .map(|(seq, _)| *seq)
            .collect();
        stale.sort_unstable();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for seq in stale {
            let Some(envelope) = state.entries.get(&seq) else {
                group_state.pending.remove(&seq);
                continue;
            };
            if let Some(entry) = group_state.pending.get_mut(&seq) {
                entry.consumer = new_consumer.to_string();
                entry.delivered_at = now;
                entry.deliveries += 1;
            }
            reclaimed.push(Delivery {
                id: Self::format_id(seq),
                envelope: envelope.clone(),
            });
        }
        Ok(reclaimed)
    }

    async fn dead_letter(
        &self,
        queue: &str,
        group: &str,
        id: &MessageId,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<()> {
        let seq = Self::parse_id(id)?;
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.dead.push((envelope.clone(), reason.to_string()));
        if let Some(group_state) = state.groups.get_mut(group) {
            group_state.pending.remove(&seq);
        }
        state.prune();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

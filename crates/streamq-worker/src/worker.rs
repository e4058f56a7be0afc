use crate::outcome::{classify_failure, FailureAction};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamq_broker::{Broker, Delivery, MessageId};
use streamq_core::{Configuration, Envelope, SerializationRegistry, TaskRouter};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Delay before retrying a failed broker read.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Consumer-side loop: fetch, decode, dispatch, then ack, retry or
/// dead-letter per message.
///
/// `run` drives `config.concurrency` consumer loops plus a periodic reclaim
/// task and a healthcheck task, all against the same consumer group. A
/// message is acked only after its handler ran to completion; anything in
/// flight when a worker dies stays in the pending-entry set until reclaimed.
/// The healthcheck keeps refreshing the idle clock on fetched-but-unresolved
/// deliveries, so a handler outliving the reclaim idle threshold is not
/// redelivered while it is still running.
pub struct Worker {
    broker: Arc<dyn Broker>,
    router: Arc<TaskRouter>,
    registry: Arc<SerializationRegistry>,
    config: Configuration,
    queue: String,
    group: String,
    consumer_base: String,
    shutdown: Notify,
    stopping: AtomicBool,
    /// Fetched-but-unresolved delivery ids, per consumer name.
    active: Mutex<HashMap<String, HashSet<MessageId>>>,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        router: Arc<TaskRouter>,
        registry: Arc<SerializationRegistry>,
        config: Configuration,
    ) -> Self {
        let consumer_base = generate_consumer_name();
        let queue = config.default_queue.clone();
        let group = config.consumer_group.clone();
        Worker {
            broker,
            router,
            registry,
            config,
            queue,
            group,
            consumer_base,
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Override the generated consumer name prefix. Names must be unique
    /// within the consumer group across all processes.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_base = name.into();
        self
    }

    /// Run until [`Worker::stop`] is called. The broker is closed on every
    /// exit path.
    pub async fn run(&self) -> streamq_core::Result<()> {
        info!(
            queue = %self.queue,
            group = %self.group,
            consumer = %self.consumer_base,
            concurrency = self.config.concurrency,
            "starting worker"
        );

        let consumers = (0..self.config.concurrency.max(1))
            .map(|i| self.consume_loop(format!("{}-{i}", self.consumer_base)))
            .collect::<Vec<_>>();
        let reclaimer = self.reclaim_loop(format!("{}-reclaim", self.consumer_base));

        futures::future::join3(join_all(consumers), reclaimer, self.healthcheck_loop()).await;

        self.broker.close().await?;
        info!(consumer = %self.consumer_base, "worker stopped");
        Ok(())
    }

    /// Stop fetching new batches. In-flight messages finish processing;
    /// unfetched and abandoned ones are left to the group.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn consume_loop(&self, consumer: String) {
        while !self.is_stopping() {
            let result = tokio::select! {
                _ = self.shutdown.notified() => break,
                result = self.broker.read(
                    &self.queue,
                    &self.group,
                    &consumer,
                    self.config.read_batch_size,
                    self.config.block_timeout(),
                ) => result,
            };

            let batch = match result {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(consumer = %consumer, error = %e, "broker read failed");
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => continue,
                    }
                }
            };

            // Fetched messages are already pending on this consumer, so they
            // are processed even when a stop request arrives mid-batch.
            self.track(&consumer, &batch);
            for delivery in batch {
                let id = delivery.id.clone();
                self.process(delivery).await;
                self.untrack(&consumer, &id);
            }
        }
        debug!(consumer = %consumer, "consumer loop exited");
    }

    /// Periodically recover deliveries abandoned by crashed peers.
    async fn reclaim_loop(&self, consumer: String) {
        let mut ticker = tokio::time::interval(self.config.reclaim_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = ticker.tick() => {}
            }
            if self.is_stopping() {
                break;
            }

            match self
                .broker
                .claim_stale(
                    &self.queue,
                    &self.group,
                    self.config.reclaim_idle_threshold(),
                    &consumer,
                )
                .await
            {
                Ok(reclaimed) => {
                    if !reclaimed.is_empty() {
                        info!(consumer = %consumer, count = reclaimed.len(), "reclaimed stale deliveries");
                    }
                    self.track(&consumer, &reclaimed);
                    for delivery in reclaimed {
                        let id = delivery.id.clone();
                        self.process(delivery).await;
                        self.untrack(&consumer, &id);
                    }
                }
                Err(e) => warn!(consumer = %consumer, error = %e, "claim_stale failed"),
            }
        }
    }

    /// Keep in-flight deliveries from looking stale: every interval, claim
    /// each consumer's unresolved ids back to itself with a zero idle floor,
    /// resetting their idle clocks.
    async fn healthcheck_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.healthcheck_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = ticker.tick() => {}
            }
            if self.is_stopping() {
                break;
            }

            let snapshot: Vec<(String, Vec<MessageId>)> = {
                let active = self.active.lock();
                active
                    .iter()
                    .filter(|(_, ids)| !ids.is_empty())
                    .map(|(consumer, ids)| (consumer.clone(), ids.iter().cloned().collect()))
                    .collect()
            };
            for (consumer, ids) in snapshot {
                if let Err(e) = self.broker.touch(&self.queue, &self.group, &consumer, &ids).await
                {
                    warn!(consumer = %consumer, error = %e, "healthcheck touch failed");
                }
            }
        }
    }

    fn track(&self, consumer: &str, batch: &[Delivery]) {
        if batch.is_empty() {
            return;
        }
        let mut active = self.active.lock();
        let ids = active.entry(consumer.to_string()).or_default();
        ids.extend(batch.iter().map(|d| d.id.clone()));
    }

    fn untrack(&self, consumer: &str, id: &MessageId) {
        let mut active = self.active.lock();
        if let Some(ids) = active.get_mut(consumer) {
            ids.remove(id);
        }
    }

    async fn process(&self, delivery: Delivery) {
        let Delivery { id, envelope } = delivery;
        let span = tracing::info_span!(
            "task",
            task = %envelope.task_name,
            message_id = %id,
            attempt = envelope.headers.attempt,
            correlation_id = %envelope.headers.correlation_id,
        );
        self.process_inner(&id, envelope).instrument(span).await;
    }

    async fn process_inner(&self, id: &MessageId, envelope: Envelope) {
        let attempt = envelope.headers.attempt;

        // A reclaimed copy may already have spent its attempt budget.
        if attempt >= self.config.max_attempts {
            let reason = format!("delivery attempts exhausted ({attempt})");
            self.send_to_dead_letter(id, &envelope, &reason).await;
            return;
        }

        let backend = match self.registry.resolve_for_decode(&envelope.backend_tag) {
            Ok(backend) => backend,
            Err(e) => {
                // A missing backend is a deployment defect on this consumer;
                // redelivery cannot fix it.
                self.send_to_dead_letter(id, &envelope, &e.to_string()).await;
                return;
            }
        };

        let args = match backend.decode(&envelope.body) {
            Ok(args) => args,
            Err(e) => {
                self.send_to_dead_letter(id, &envelope, &format!("decode_error: {e}"))
                    .await;
                return;
            }
        };

        match self.router.dispatch(&envelope.task_name, args).await {
            Err(e) => {
                // Unknown task: same terminal class as a decode failure.
                self.send_to_dead_letter(id, &envelope, &e.to_string()).await;
            }
            Ok(Ok(_result)) => {
                debug!("task completed");
                if let Err(e) = self.broker.ack(&self.queue, &self.group, id).await {
                    warn!(error = %e, "ack failed; delivery will be reclaimed");
                }
            }
            Ok(Err(failure)) => match classify_failure(&failure, attempt, &self.config) {
                FailureAction::DeadLetter { reason } => {
                    self.send_to_dead_letter(id, &envelope, &reason).await;
                }
                FailureAction::Retry { delay } => {
                    self.retry(id, &envelope, delay, failure.reason()).await;
                }
            },
        }
    }

    /// Re-enqueue a fresh copy with the attempt counter advanced, then ack
    /// the original so the retry gets its own delivery cycle.
    ///
    /// The backoff is honored by delaying the re-append: a crash during the
    /// delay leaves the original pending, where `claim_stale` recovers it.
    async fn retry(&self, id: &MessageId, envelope: &Envelope, delay: Duration, reason: &str) {
        warn!(
            delay_ms = delay.as_millis() as u64,
            reason, "task failed transiently; retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.broker.append(&self.queue, &envelope.retried()).await {
            Ok(retry_id) => {
                debug!(retry_id = %retry_id, "re-enqueued for retry");
                if let Err(e) = self.broker.ack(&self.queue, &self.group, id).await {
                    warn!(error = %e, "ack after re-enqueue failed; a duplicate delivery is possible");
                }
            }
            Err(e) => {
                // Leave the original pending; reclamation redelivers it.
                warn!(error = %e, "re-enqueue failed; original left for reclaim");
            }
        }
    }

    async fn send_to_dead_letter(&self, id: &MessageId, envelope: &Envelope, reason: &str) {
        warn!(reason, "dead-lettering message");
        if let Err(e) = self
            .broker
            .dead_letter(&self.queue, &self.group, id, envelope, reason)
            .await
        {
            error!(error = %e, "dead-letter append failed; delivery stays pending");
        }
    }
}

fn generate_consumer_name() -> String {
    let short_id = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &short_id[..8])
}

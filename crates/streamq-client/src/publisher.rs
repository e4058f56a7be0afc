use std::sync::Arc;
use streamq_broker::{Broker, MessageId};
use streamq_core::{Configuration, Envelope, Result, SerializationRegistry, TaskInvocation};
use tracing::debug;

/// Turns task invocations into envelopes on the broker.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    registry: Arc<SerializationRegistry>,
    config: Configuration,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<SerializationRegistry>,
        config: Configuration,
    ) -> Self {
        Publisher {
            broker,
            registry,
            config,
        }
    }

    /// Encode and durably enqueue one invocation.
    ///
    /// The backend is the invocation's override if set, else the registry
    /// default; the queue likewise. The append is a single atomic call, so a
    /// failure never leaves a partial enqueue behind.
    pub async fn enqueue(&self, invocation: TaskInvocation) -> Result<MessageId> {
        let backend = self
            .registry
            .resolve_for_encode(invocation.backend_override.as_deref())?;
        let body = backend.encode(&invocation.args)?;

        let envelope = Envelope::new(
            backend.tag().to_string(),
            invocation.task_name,
            body,
        );

        let queue = invocation
            .queue_override
            .as_deref()
            .unwrap_or(&self.config.default_queue);
        let id = self.broker.append(queue, &envelope).await?;

        debug!(
            queue,
            task = %envelope.task_name,
            backend = %envelope.backend_tag,
            id = %id,
            correlation_id = %envelope.headers.correlation_id,
            "enqueued task"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use streamq_broker::InMemoryBroker;
    use streamq_core::{QueueError, TaskFailure, TaskRouter, YamlBackend};

    fn publisher_parts() -> (Arc<InMemoryBroker>, Publisher, TaskRouter) {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = SerializationRegistry::json_only();
        registry.register(Arc::new(YamlBackend)).unwrap();

        let mut router = TaskRouter::new();
        router
            .register_fn("noop", |_: serde_json::Value| async {
                Ok::<_, TaskFailure>(serde_json::Value::Null)
            })
            .unwrap();

        let publisher = Publisher::new(
            broker.clone(),
            Arc::new(registry),
            Configuration::default(),
        );
        (broker, publisher, router)
    }

    #[tokio::test]
    async fn test_enqueue_stores_envelope() {
        let (broker, publisher, router) = publisher_parts();

        let invocation = router.invocation("noop", &json!({"a": 1})).unwrap();
        let id = publisher.enqueue(invocation).await.unwrap();

        let entries = broker.entries("streamq");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, id);

        let envelope = &entries[0].1;
        assert_eq!(envelope.task_name, "noop");
        assert_eq!(envelope.backend_tag, "json");
        assert_eq!(envelope.headers.attempt, 0);
        assert!(!envelope.headers.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_honors_overrides() {
        let (broker, publisher, router) = publisher_parts();

        let invocation = router
            .invocation("noop", &json!({}))
            .unwrap()
            .with_backend("yaml")
            .with_queue("reports");
        publisher.enqueue(invocation).await.unwrap();

        assert!(broker.entries("streamq").is_empty());
        let entries = broker.entries("reports");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.backend_tag, "yaml");
    }

    #[tokio::test]
    async fn test_enqueue_unknown_backend() {
        let (broker, publisher, router) = publisher_parts();

        let invocation = router
            .invocation("noop", &json!({}))
            .unwrap()
            .with_backend("msgpack");
        let err = publisher.enqueue(invocation).await.unwrap_err();

        assert!(matches!(err, QueueError::UnknownBackend(tag) if tag == "msgpack"));
        assert!(broker.entries("streamq").is_empty());
    }
}

//! End-to-end demo on the in-memory broker: a producer enqueues a few tasks
//! and a worker drains them.
//!
//! Run with `cargo run -p streamq-worker --example demo_worker`.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use streamq_broker::InMemoryBroker;
use streamq_client::Publisher;
use streamq_core::{Configuration, SerializationRegistry, TaskFailure, TaskRouter};
use streamq_worker::Worker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

#[derive(Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = Configuration {
        block_timeout_ms: 200,
        concurrency: 2,
        ..Configuration::default()
    };

    let mut router = TaskRouter::new();
    router.register_fn("send-email", |args: SendEmail| async move {
        tracing::info!(to = %args.to, subject = %args.subject, "pretending to send email");
        Ok(Value::Null)
    })?;
    router.register_fn("add", |args: Add| async move {
        if args.a < 0 || args.b < 0 {
            return Err(TaskFailure::Permanent("operands must be non-negative".into()));
        }
        Ok(json!(args.a + args.b))
    })?;
    let router = Arc::new(router);

    let worker = Arc::new(Worker::new(
        broker.clone(),
        router.clone(),
        registry.clone(),
        config.clone(),
    ));
    let runner = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // Let the worker create the consumer group before producing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let publisher = Publisher::new(broker.clone(), registry, config.clone());
    publisher
        .enqueue(router.invocation(
            "send-email",
            &json!({"to": "ops@example.com", "subject": "nightly report"}),
        )?)
        .await?;
    publisher
        .enqueue(router.invocation("add", &json!({"a": 20, "b": 22}))?)
        .await?;
    publisher
        .enqueue(router.invocation("add", &json!({"a": -1, "b": 5}))?)
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    for (envelope, reason) in broker.dead_letters(&config.default_queue) {
        tracing::info!(task = %envelope.task_name, reason, "dead-lettered");
    }

    worker.stop();
    runner.await??;
    Ok(())
}

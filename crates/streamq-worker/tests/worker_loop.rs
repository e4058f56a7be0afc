use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamq_broker::{Broker, InMemoryBroker};
use streamq_client::Publisher;
use streamq_core::{
    Configuration, Envelope, SerializationRegistry, TaskFailure, TaskRouter, YamlBackend,
};
use streamq_worker::Worker;

fn test_config() -> Configuration {
    Configuration {
        max_attempts: 3,
        retry_backoff_base_ms: 0,
        retry_backoff_max_ms: 0,
        // High enough that in-flight deliveries are never reclaimed out from
        // under a healthy loop.
        reclaim_idle_threshold_secs: 600,
        reclaim_interval_secs: 1,
        read_batch_size: 10,
        block_timeout_ms: 50,
        concurrency: 1,
        ..Configuration::default()
    }
}

/// Create the consumer group before anything is enqueued, the way worker
/// deployments come up before producers. Groups start at the queue tail.
async fn prepare_group(broker: &InMemoryBroker, config: &Configuration) {
    broker
        .read(
            &config.default_queue,
            &config.consumer_group,
            "warmup",
            1,
            Duration::ZERO,
        )
        .await
        .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn spawn_worker(worker: Arc<Worker>) -> tokio::task::JoinHandle<streamq_core::Result<()>> {
    tokio::spawn(async move { worker.run().await })
}

#[derive(Deserialize)]
struct PairArgs {
    a: i64,
    b: String,
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = test_config();

    let seen: Arc<Mutex<Vec<(i64, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut router = TaskRouter::new();
    {
        let seen = seen.clone();
        router
            .register_fn("task-name", move |args: PairArgs| {
                let seen = seen.clone();
                async move {
                    seen.lock().push((args.a, args.b));
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;

    let publisher = Publisher::new(broker.clone(), registry.clone(), config.clone());
    let invocation = router
        .invocation("task-name", &json!({"a": 42, "b": "string"}))
        .unwrap()
        .with_backend("json");
    publisher.enqueue(invocation).await.unwrap();

    // The broker holds exactly the envelope the producer described.
    let entries = broker.entries(&config.default_queue);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.task_name, "task-name");
    assert_eq!(entries[0].1.backend_tag, "json");

    let worker = Arc::new(Worker::new(
        broker.clone(),
        router,
        registry,
        config.clone(),
    ));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(|| seen.lock().len() == 1, Duration::from_secs(5)).await,
        "handler never ran"
    );
    assert_eq!(seen.lock()[0], (42, "string".to_string()));

    // Exactly-once processing: acked, and no second invocation shows up.
    assert!(
        wait_until(
            || broker.pending_len(&config.default_queue, &config.consumer_group) == 0,
            Duration::from_secs(5)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.lock().len(), 1);

    worker.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_two_consumers_no_loss_no_duplicates() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = test_config();

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let mut router = TaskRouter::new();
    {
        let seen = seen.clone();
        router
            .register_fn("record", move |n: i64| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(n);
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;

    let publisher = Publisher::new(broker.clone(), registry.clone(), config.clone());
    for n in [1i64, 2, 3] {
        publisher
            .enqueue(router.invocation("record", &n).unwrap())
            .await
            .unwrap();
    }

    let alpha = Arc::new(
        Worker::new(broker.clone(), router.clone(), registry.clone(), config.clone())
            .with_consumer_name("alpha"),
    );
    let beta = Arc::new(
        Worker::new(broker.clone(), router.clone(), registry.clone(), config.clone())
            .with_consumer_name("beta"),
    );
    let alpha_handle = spawn_worker(alpha.clone());
    let beta_handle = spawn_worker(beta.clone());

    assert!(
        wait_until(|| seen.lock().len() >= 3, Duration::from_secs(5)).await,
        "not all messages processed"
    );
    assert!(
        wait_until(
            || broker.pending_len(&config.default_queue, &config.consumer_group) == 0,
            Duration::from_secs(5)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut processed = seen.lock().clone();
    processed.sort_unstable();
    assert_eq!(processed, vec![1, 2, 3]);

    alpha.stop();
    beta.stop();
    alpha_handle.await.unwrap().unwrap();
    beta_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transient_failure_dead_letters_after_max_attempts() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = test_config();

    let calls = Arc::new(AtomicU32::new(0));
    let mut router = TaskRouter::new();
    {
        let calls = calls.clone();
        router
            .register_fn("always-flaky", move |_: Value| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TaskFailure::Transient("downstream timeout".to_string()))
                }
            })
            .unwrap();
    }
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;

    let publisher = Publisher::new(broker.clone(), registry.clone(), config.clone());
    publisher
        .enqueue(router.invocation("always-flaky", &json!(null)).unwrap())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(broker.clone(), router, registry, config.clone()));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(
            || !broker.dead_letters(&config.default_queue).is_empty(),
            Duration::from_secs(5)
        )
        .await,
        "message never dead-lettered"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Exactly max_attempts deliveries, never fewer, never more.
    assert_eq!(calls.load(Ordering::SeqCst), config.max_attempts);

    let dead = broker.dead_letters(&config.default_queue);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0.headers.attempt, config.max_attempts - 1);
    assert!(dead[0].1.contains("retries exhausted"));
    assert_eq!(
        broker.pending_len(&config.default_queue, &config.consumer_group),
        0
    );

    worker.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = test_config();

    let calls = Arc::new(AtomicU32::new(0));
    let mut router = TaskRouter::new();
    {
        let calls = calls.clone();
        router
            .register_fn("rejects", move |_: Value| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TaskFailure::Permanent("unprocessable".to_string()))
                }
            })
            .unwrap();
    }
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;
    let publisher = Publisher::new(broker.clone(), registry.clone(), config.clone());
    publisher
        .enqueue(router.invocation("rejects", &json!(null)).unwrap())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(broker.clone(), router, registry, config.clone()));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(
            || !broker.dead_letters(&config.default_queue).is_empty(),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(broker.dead_letters(&config.default_queue)[0]
        .1
        .contains("permanent failure"));

    worker.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_task_is_dead_lettered() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = test_config();

    // Producer knows the task; this consumer does not.
    let mut producer_router = TaskRouter::new();
    producer_router
        .register_fn("ghost-task", |_: Value| async { Ok(Value::Null) })
        .unwrap();

    prepare_group(&broker, &config).await;
    let publisher = Publisher::new(broker.clone(), registry.clone(), config.clone());
    publisher
        .enqueue(producer_router.invocation("ghost-task", &json!(null)).unwrap())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(
        broker.clone(),
        Arc::new(TaskRouter::new()),
        registry,
        config.clone(),
    ));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(
            || !broker.dead_letters(&config.default_queue).is_empty(),
            Duration::from_secs(5)
        )
        .await
    );
    let dead = broker.dead_letters(&config.default_queue);
    assert!(dead[0].1.contains("unknown task"));
    assert_eq!(
        broker.pending_len(&config.default_queue, &config.consumer_group),
        0
    );

    worker.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_backend_is_dead_lettered() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = test_config();

    // Producer registry carries yaml; the consumer's does not.
    let mut producer_registry = SerializationRegistry::json_only();
    producer_registry.register(Arc::new(YamlBackend)).unwrap();
    let producer_registry = Arc::new(producer_registry);

    let mut router = TaskRouter::new();
    router
        .register_fn("noop", |_: Value| async { Ok(Value::Null) })
        .unwrap();
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;
    let publisher = Publisher::new(broker.clone(), producer_registry, config.clone());
    publisher
        .enqueue(
            router
                .invocation("noop", &json!({"k": "v"}))
                .unwrap()
                .with_backend("yaml"),
        )
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(
        broker.clone(),
        router,
        Arc::new(SerializationRegistry::json_only()),
        config.clone(),
    ));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(
            || !broker.dead_letters(&config.default_queue).is_empty(),
            Duration::from_secs(5)
        )
        .await
    );
    assert!(broker.dead_letters(&config.default_queue)[0]
        .1
        .contains("unknown serialization backend"));

    worker.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_long_running_handler_is_not_redelivered() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    // Idle threshold shorter than the handler's runtime; only the
    // healthcheck keeps the delivery from looking stale.
    let config = Configuration {
        reclaim_idle_threshold_secs: 2,
        reclaim_interval_secs: 1,
        healthcheck_interval_secs: 1,
        ..test_config()
    };

    let calls = Arc::new(AtomicU32::new(0));
    let mut router = TaskRouter::new();
    {
        let calls = calls.clone();
        router
            .register_fn("slow", move |_: Value| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;
    let publisher = Publisher::new(broker.clone(), registry.clone(), config.clone());
    publisher
        .enqueue(router.invocation("slow", &json!(null)).unwrap())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(broker.clone(), router, registry, config.clone()));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(
            || broker.pending_len(&config.default_queue, &config.consumer_group) == 0
                && calls.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(10)
        )
        .await,
        "slow task never completed"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "handler ran more than once without a crash"
    );
    assert!(broker.dead_letters(&config.default_queue).is_empty());

    worker.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_crash_recovery_via_reclaim() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = Configuration {
        reclaim_idle_threshold_secs: 0,
        ..test_config()
    };

    let calls = Arc::new(AtomicU32::new(0));
    let mut router = TaskRouter::new();
    {
        let calls = calls.clone();
        router
            .register_fn("recoverable", move |_: Value| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;
    let publisher = Publisher::new(broker.clone(), registry.clone(), config.clone());
    publisher
        .enqueue(router.invocation("recoverable", &json!(null)).unwrap())
        .await
        .unwrap();

    // A consumer fetches the message and then "crashes" without acking.
    let fetched = broker
        .read(
            &config.default_queue,
            &config.consumer_group,
            "crashed-consumer",
            10,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(
        broker.pending_len(&config.default_queue, &config.consumer_group),
        1
    );

    // A surviving worker reclaims and completes it.
    let worker = Arc::new(Worker::new(broker.clone(), router, registry, config.clone()));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(|| calls.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await,
        "reclaimed message never processed"
    );
    assert!(
        wait_until(
            || broker.pending_len(&config.default_queue, &config.consumer_group) == 0,
            Duration::from_secs(5)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    worker.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_exhausted_delivery_is_dead_lettered_without_dispatch() {
    let broker = Arc::new(InMemoryBroker::new());
    let registry = Arc::new(SerializationRegistry::json_only());
    let config = test_config();

    let calls = Arc::new(AtomicU32::new(0));
    let mut router = TaskRouter::new();
    {
        let calls = calls.clone();
        router
            .register_fn("counted", move |_: Value| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }
    let router = Arc::new(router);

    prepare_group(&broker, &config).await;

    // An envelope that already spent its whole attempt budget.
    let mut envelope = Envelope::new("json".to_string(), "counted".to_string(), b"null".to_vec());
    envelope.headers.attempt = config.max_attempts;
    broker.append(&config.default_queue, &envelope).await.unwrap();

    let worker = Arc::new(Worker::new(broker.clone(), router, registry, config.clone()));
    let handle = spawn_worker(worker.clone());

    assert!(
        wait_until(
            || !broker.dead_letters(&config.default_queue).is_empty(),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(broker.dead_letters(&config.default_queue)[0]
        .1
        .contains("exhausted"));

    worker.stop();
    handle.await.unwrap().unwrap();
}

//! End-to-end engine tests against the in-memory store.
//!
//! Ordering assertions are partition-local on purpose: the dispatcher
//! guarantees strict priority + FIFO ordering only within a single
//! partition. Cross-partition ordering is an accepted trade-off and is not
//! asserted anywhere in this suite.

use parking_lot::Mutex;
use relay_core::{
    BatchOptions, DispatchError, PayloadEnvelope, Priority, TaskDescriptor, TaskId, TaskRecord,
    TaskStatus, WorkerKind,
};
use relay_dispatch::{
    AutoscalerConfig, DispatchEngine, Dispatcher, EngineConfig, FunctionRegistry, PoolConfig,
};
use relay_queue::{MemoryLockManager, MemoryQueueStore, Partitioner, QueueStore, RetryPolicy};
use relay_resilience::{CircuitBreakerConfig, RateLimiterConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> EngineConfig {
    EngineConfig {
        partition_count: 4,
        retry_policy: RetryPolicy::fixed(Duration::from_millis(10)).without_jitter(),
        pool: PoolConfig {
            idle_backoff_min_ms: 5,
            idle_backoff_max_ms: 40,
            spawn_check_interval_ms: 10,
            drain_timeout_secs: 5,
        },
        autoscaler: AutoscalerConfig {
            sample_interval_ms: 100,
            ..Default::default()
        },
        // High threshold so tests that are not about the breaker never trip it.
        breaker: CircuitBreakerConfig {
            failure_threshold: 100_000,
            ..Default::default()
        },
        rate_limiter: RateLimiterConfig {
            default_per_second: 100_000,
            per_category: HashMap::new(),
        },
    }
}

struct Harness {
    engine: DispatchEngine,
    dispatcher: Arc<Dispatcher>,
    store: Arc<MemoryQueueStore>,
}

fn harness(registry: Arc<FunctionRegistry>, config: EngineConfig) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryQueueStore::new(1000));
    let locks = Arc::new(MemoryLockManager::new());
    let engine = DispatchEngine::new(registry, store.clone(), locks, config);
    let dispatcher = engine.dispatcher();
    Harness {
        engine,
        dispatcher,
        store,
    }
}

fn descriptor(function: &str, category: &str) -> TaskDescriptor {
    TaskDescriptor {
        name: format!("{function}-task"),
        function: function.into(),
        payload: PayloadEnvelope::new("test.v1", "{}"),
        priority: Priority::Normal,
        worker_kind: WorkerKind::Io,
        category: category.into(),
        timeout_secs: 5,
        max_retries: 2,
        metadata: HashMap::new(),
    }
}

async fn await_status(
    dispatcher: &Dispatcher,
    task_id: &TaskId,
    expected: TaskStatus,
    deadline: Duration,
) {
    let start = std::time::Instant::now();
    loop {
        let view = dispatcher.get_status(task_id).await.expect("status");
        if view.status == expected {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "task {task_id} stuck in {:?}, wanted {expected:?}",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_executes_and_records_the_result() {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("echo", |ctx| {
        Box::pin(async move { Ok(PayloadEnvelope::new("test.v1", ctx.payload.body)) })
    });

    let h = harness(registry, test_config());
    h.engine.start();

    let receipt = h.dispatcher.submit(descriptor("echo", "general")).await.unwrap();
    assert!(receipt.partition < 4);
    assert!(receipt.estimated_completion > chrono::Utc::now());

    await_status(
        &h.dispatcher,
        &receipt.task_id,
        TaskStatus::Completed,
        Duration::from_secs(5),
    )
    .await;

    let view = h.dispatcher.get_status(&receipt.task_id).await.unwrap();
    assert!(view.result.is_some());
    assert_eq!(view.retry_count, 0);
    assert!(view.started_at.is_some() && view.completed_at.is_some());

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn every_task_executes_exactly_once() {
    let executions: Arc<Mutex<HashMap<TaskId, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let registry = Arc::new(FunctionRegistry::new());
    {
        let executions = executions.clone();
        registry.register("count", move |ctx| {
            let executions = executions.clone();
            Box::pin(async move {
                *executions.lock().entry(ctx.task_id).or_insert(0) += 1;
                Ok(PayloadEnvelope::default())
            })
        });
    }

    let h = harness(registry, test_config());
    h.engine.start();

    let mut ids = Vec::new();
    for i in 0..50 {
        let mut d = descriptor("count", &format!("cat-{}", i % 7));
        d.max_retries = 1;
        ids.push(h.dispatcher.submit(d).await.unwrap().task_id);
    }

    for id in &ids {
        await_status(&h.dispatcher, id, TaskStatus::Completed, Duration::from_secs(10)).await;
    }

    let executions = executions.lock();
    assert_eq!(executions.len(), 50);
    assert!(executions.values().all(|&count| count == 1));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn always_failing_task_dead_letters_with_spent_budget() {
    // A critical io task with max_retries = 2 whose function always raises
    // runs 3 attempts total, then dead-letters with retry_count = 2.
    let attempts = Arc::new(Mutex::new(0u32));
    let registry = Arc::new(FunctionRegistry::new());
    {
        let attempts = attempts.clone();
        registry.register("always-fails", move |_ctx| {
            let attempts = attempts.clone();
            Box::pin(async move {
                *attempts.lock() += 1;
                Err(DispatchError::Execution("provider unavailable".into()))
            })
        });
    }

    let h = harness(registry, test_config());
    h.engine.start();

    let mut d = descriptor("always-fails", "ocr");
    d.priority = Priority::Critical;
    d.timeout_secs = 5;
    d.max_retries = 2;
    let receipt = h.dispatcher.submit(d).await.unwrap();

    await_status(
        &h.dispatcher,
        &receipt.task_id,
        TaskStatus::DeadLettered,
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(*attempts.lock(), 3); // 1 initial + 2 retries

    let view = h.dispatcher.get_status(&receipt.task_id).await.unwrap();
    assert_eq!(view.retry_count, 2);

    let records = h
        .dispatcher
        .list_dead_letters(Some(WorkerKind::Io))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task.id, receipt.task_id);
    assert_eq!(records[0].total_retries, 2);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_creates_a_fresh_task_and_purges_the_record() {
    let should_fail = Arc::new(Mutex::new(true));
    let registry = Arc::new(FunctionRegistry::new());
    {
        let should_fail = should_fail.clone();
        registry.register("flaky", move |_ctx| {
            let should_fail = should_fail.clone();
            Box::pin(async move {
                if *should_fail.lock() {
                    Err(DispatchError::Execution("down".into()))
                } else {
                    Ok(PayloadEnvelope::default())
                }
            })
        });
    }

    let h = harness(registry, test_config());
    h.engine.start();

    let mut d = descriptor("flaky", "voice");
    d.max_retries = 1;
    let original = h.dispatcher.submit(d).await.unwrap();
    await_status(
        &h.dispatcher,
        &original.task_id,
        TaskStatus::DeadLettered,
        Duration::from_secs(10),
    )
    .await;

    let records = h.dispatcher.list_dead_letters(None).await.unwrap();
    assert_eq!(records.len(), 1);
    let dlq_id = records[0].id;

    // Fixed downstream: the replay runs clean under a new id.
    *should_fail.lock() = false;
    let replayed = h.dispatcher.replay(&dlq_id).await.unwrap();
    assert_ne!(replayed.task_id, original.task_id);

    await_status(
        &h.dispatcher,
        &replayed.task_id,
        TaskStatus::Completed,
        Duration::from_secs(10),
    )
    .await;

    let view = h.dispatcher.get_status(&replayed.task_id).await.unwrap();
    assert_eq!(view.retry_count, 0);

    assert!(h.dispatcher.list_dead_letters(None).await.unwrap().is_empty());
    assert!(matches!(
        h.dispatcher.replay(&dlq_id).await,
        Err(DispatchError::NotFound { .. })
    ));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_queued_task_prevents_execution() {
    let executed = Arc::new(Mutex::new(false));
    let registry = Arc::new(FunctionRegistry::new());
    {
        let executed = executed.clone();
        registry.register("never", move |_ctx| {
            let executed = executed.clone();
            Box::pin(async move {
                *executed.lock() = true;
                Ok(PayloadEnvelope::default())
            })
        });
    }

    // Engine deliberately not started yet: the task must stay QUEUED.
    let h = harness(registry, test_config());

    let receipt = h.dispatcher.submit(descriptor("never", "general")).await.unwrap();
    let status = h.dispatcher.cancel(&receipt.task_id).await.unwrap();
    assert_eq!(status, TaskStatus::Cancelled);

    // Even with workers running afterwards, the task is gone from the queue.
    h.engine.start();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let view = h.dispatcher.get_status(&receipt.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert!(!*executed.lock());

    // Cancelling a terminal task conflicts.
    assert!(matches!(
        h.dispatcher.cancel(&receipt.task_id).await,
        Err(DispatchError::Conflict(_))
    ));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn running_task_cancellation_is_cooperative() {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("observer", |ctx| {
        Box::pin(async move {
            // Observes the cancel flag at its own checkpoints; the result it
            // returns afterwards is discarded by the supervisor.
            for _ in 0..500 {
                if ctx.is_cancelled() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(PayloadEnvelope::new("test.v1", "late result"))
        })
    });

    let h = harness(registry, test_config());
    h.engine.start();

    let mut d = descriptor("observer", "general");
    d.timeout_secs = 30;
    let receipt = h.dispatcher.submit(d).await.unwrap();

    await_status(
        &h.dispatcher,
        &receipt.task_id,
        TaskStatus::Running,
        Duration::from_secs(5),
    )
    .await;

    let status = h.dispatcher.cancel(&receipt.task_id).await.unwrap();
    assert_eq!(status, TaskStatus::Running); // cooperative, not immediate

    await_status(
        &h.dispatcher,
        &receipt.task_id,
        TaskStatus::Cancelled,
        Duration::from_secs(15),
    )
    .await;

    let view = h.dispatcher.get_status(&receipt.task_id).await.unwrap();
    assert!(view.result.is_none(), "discards the late result");

    h.engine.shutdown().await;
}

#[tokio::test]
async fn claim_order_is_priority_grouped_and_fifo_within_tiers() {
    // Store-level scenario: 100 mixed-priority tasks on one partition are
    // claimed grouped by tier, FIFO within each tier.
    let store = MemoryQueueStore::new(1000);
    let tiers = [Priority::Low, Priority::Critical, Priority::Normal];

    let mut submitted: Vec<(Priority, TaskId)> = Vec::new();
    for i in 0..100 {
        let mut d = descriptor("any", "same-category");
        d.priority = tiers[i % tiers.len()];
        let task = TaskRecord::from_descriptor(d, 0);
        submitted.push((task.priority, task.id));
        store.enqueue(&task).await.unwrap();
    }

    let mut claimed = Vec::new();
    while let Some(task) = store.claim(WorkerKind::Io, 0, "w1").await.unwrap() {
        claimed.push((task.priority, task.id));
    }
    assert_eq!(claimed.len(), 100);

    // Grouped by tier: ranks never decrease along the claim order.
    let ranks: Vec<u8> = claimed.iter().map(|(p, _)| p.rank()).collect();
    assert!(ranks.windows(2).all(|w| w[0] <= w[1]));

    // FIFO within each tier: claim order matches submission order.
    for tier in tiers {
        let submitted_tier: Vec<TaskId> = submitted
            .iter()
            .filter(|(p, _)| *p == tier)
            .map(|(_, id)| *id)
            .collect();
        let claimed_tier: Vec<TaskId> = claimed
            .iter()
            .filter(|(p, _)| *p == tier)
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(submitted_tier, claimed_tier);
    }
}

#[tokio::test]
async fn same_routing_key_always_lands_on_one_partition() {
    let partitioner = Partitioner::new(4);
    let first = partitioner.route(&descriptor("f", "ocr"));
    for _ in 0..20 {
        assert_eq!(partitioner.route(&descriptor("f", "ocr")), first);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_submission_reports_partial_success() {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("ok", |_ctx| Box::pin(async { Ok(PayloadEnvelope::default()) }));

    let h = harness(registry, test_config());
    h.engine.start();

    let mut bad_timeout = descriptor("ok", "general");
    bad_timeout.timeout_secs = 0;
    let unknown_function = descriptor("ghost", "general");

    let receipt = h
        .dispatcher
        .submit_batch(
            vec![descriptor("ok", "general"), bad_timeout, unknown_function],
            BatchOptions {
                priority: Some(Priority::High),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(receipt.accepted.len(), 1);
    assert_eq!(receipt.rejected.len(), 2);
    assert_eq!(receipt.rejected[0].index, 1);
    assert_eq!(receipt.rejected[0].error_code, "VALIDATION_ERROR");
    assert_eq!(receipt.rejected[1].error_code, "UNKNOWN_FUNCTION");

    // The batch priority override applied to the accepted member.
    let view = h
        .dispatcher
        .get_status(&receipt.accepted[0].task_id)
        .await
        .unwrap();
    assert_eq!(view.priority, Priority::High);

    let batch = h.dispatcher.get_batch(&receipt.batch_id).unwrap();
    assert_eq!(batch.task_ids.len(), 1);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_category_rejects_with_retry_after() {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("ok", |_ctx| Box::pin(async { Ok(PayloadEnvelope::default()) }));

    let mut config = test_config();
    config.rate_limiter.per_category.insert("limited".into(), 1);
    let h = harness(registry, config);

    assert!(h.dispatcher.submit(descriptor("ok", "limited")).await.is_ok());
    match h.dispatcher.submit(descriptor("ok", "limited")).await {
        Err(DispatchError::RateLimited {
            category,
            retry_after_ms,
        }) => {
            assert_eq!(category, "limited");
            assert!(retry_after_ms > 0);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // Other categories are unaffected.
    assert!(h.dispatcher.submit(descriptor("ok", "open")).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn open_circuit_fails_submissions_fast() {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("always-fails", |_ctx| {
        Box::pin(async { Err(DispatchError::Execution("down".into())) })
    });

    let mut config = test_config();
    config.breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        ..Default::default()
    };
    let h = harness(registry, config);
    h.engine.start();

    let mut d = descriptor("always-fails", "fragile");
    d.max_retries = 1;
    let receipt = h.dispatcher.submit(d).await.unwrap();
    await_status(
        &h.dispatcher,
        &receipt.task_id,
        TaskStatus::DeadLettered,
        Duration::from_secs(10),
    )
    .await;

    // Two failed attempts tripped the breaker; the category now fails fast.
    match h.dispatcher.submit(descriptor("always-fails", "fragile")).await {
        Err(DispatchError::CircuitOpen(category)) => assert_eq!(category, "fragile"),
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    // Other categories keep flowing.
    registry_ok(&h).await;

    h.engine.shutdown().await;
}

async fn registry_ok(h: &Harness) {
    // A healthy category still submits while another category's breaker is
    // open. The function is unknown on purpose only in unhealthy tests;
    // here we reuse the failing one but a different category.
    let mut d = descriptor("always-fails", "healthy");
    d.max_retries = 1;
    assert!(h.dispatcher.submit(d).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn store_outage_fails_submission_closed() {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("ok", |_ctx| Box::pin(async { Ok(PayloadEnvelope::default()) }));

    let h = harness(registry, test_config());

    let d = descriptor("ok", "general");
    let partition = Partitioner::new(4).route(&d);
    h.store.set_partition_available(partition, false);

    assert!(matches!(
        h.dispatcher.submit(d.clone()).await,
        Err(DispatchError::QueueUnavailable(_))
    ));

    // Nothing was buffered: restoring the shard does not surface the task.
    h.store.set_partition_available(partition, true);
    assert_eq!(h.store.depth_for_kind(WorkerKind::Io), 0);

    // A fresh submission succeeds.
    assert!(h.dispatcher.submit(d).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn lock_lifecycle_with_fencing_tokens() {
    let registry = Arc::new(FunctionRegistry::new());
    let h = harness(registry, test_config());

    // A acquires with a short lease, the lease expires, B acquires, then
    // A's release with its superseded token fails.
    let grant_a = h.dispatcher.acquire_lock("resource-x", "A", 1).await.unwrap();

    assert!(matches!(
        h.dispatcher.acquire_lock("resource-x", "B", 1).await,
        Err(DispatchError::LockContention { .. })
    ));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let grant_b = h.dispatcher.acquire_lock("resource-x", "B", 5).await.unwrap();
    assert!(grant_b.token > grant_a.token);

    assert!(h
        .dispatcher
        .release_lock("resource-x", "A", grant_a.token)
        .await
        .is_err());

    let renewed = h
        .dispatcher
        .renew_lock("resource-x", "B", grant_b.token, 10)
        .await
        .unwrap();
    assert_eq!(renewed.token, grant_b.token);

    assert!(h
        .dispatcher
        .release_lock("resource-x", "B", grant_b.token)
        .await
        .is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn metrics_snapshot_reflects_outcomes() {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("ok", |_ctx| Box::pin(async { Ok(PayloadEnvelope::default()) }));
    registry.register("always-fails", |_ctx| {
        Box::pin(async { Err(DispatchError::Execution("down".into())) })
    });

    let h = harness(registry, test_config());
    h.engine.start();

    let ok = h.dispatcher.submit(descriptor("ok", "mixed")).await.unwrap();
    let mut failing = descriptor("always-fails", "mixed");
    failing.max_retries = 1;
    let failed = h.dispatcher.submit(failing).await.unwrap();

    await_status(&h.dispatcher, &ok.task_id, TaskStatus::Completed, Duration::from_secs(10)).await;
    await_status(
        &h.dispatcher,
        &failed.task_id,
        TaskStatus::DeadLettered,
        Duration::from_secs(10),
    )
    .await;

    let snapshot = h.dispatcher.get_metrics();
    let io = snapshot.pools.get(&WorkerKind::Io).expect("io pool stats");
    assert!(io.completed >= 1);
    assert!(io.dead_lettered >= 1);
    assert!(io.avg_exec_ms >= 0.0);

    let mixed = snapshot.categories.get("mixed").expect("category stats");
    assert_eq!(mixed.submitted, 2);
    assert!(mixed.error_rate() > 0.0);

    // The snapshot is the metrics API payload; it must serialize cleanly.
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"io\""));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn get_status_of_unknown_task_is_not_found() {
    let registry = Arc::new(FunctionRegistry::new());
    let h = harness(registry, test_config());

    assert!(matches!(
        h.dispatcher.get_status(&TaskId::new()).await,
        Err(DispatchError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_function_is_rejected_before_enqueue() {
    let registry = Arc::new(FunctionRegistry::new());
    let h = harness(registry, test_config());

    match h.dispatcher.submit(descriptor("ghost", "general")).await {
        Err(DispatchError::UnknownFunction(name)) => assert_eq!(name, "ghost"),
        other => panic!("expected UnknownFunction, got {other:?}"),
    }
    assert_eq!(h.store.depth_for_kind(WorkerKind::Io), 0);
}

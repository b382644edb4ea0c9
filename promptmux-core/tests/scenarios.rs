//! End-to-end scenarios over a scripted engine.

use promptmux_core::{
    BackpressurePolicy, Counter, LifecycleEvent, MemoryEventSink, MemoryMetricsSink,
    SessionManager, Settings,
};
use promptmux_engine::{
    CancelReason, EngineError, ErrorKind, MessagePayload, MockBehavior, MockSpawner,
    ScriptedEngine, SessionConfig, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    manager: SessionManager,
    engines: mpsc::UnboundedReceiver<ScriptedEngine>,
    spawner: Arc<MockSpawner>,
    events: Arc<MemoryEventSink>,
    metrics: Arc<MemoryMetricsSink>,
}

fn harness(settings: Settings) -> Harness {
    let (spawner, engines) = MockSpawner::pair();
    let events = Arc::new(MemoryEventSink::default());
    let metrics = Arc::new(MemoryMetricsSink::default());
    let manager = SessionManager::new(
        settings,
        spawner.clone(),
        Arc::new(SystemClock::new()),
        events.clone(),
        metrics.clone(),
    )
    .unwrap();
    Harness {
        manager,
        engines,
        spawner,
        events,
        metrics,
    }
}

const DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn simple_completion() {
    let mut h = harness(Settings::default());
    let session = h
        .manager
        .create(
            SessionConfig::builder()
                .working_dir("/ws")
                .max_turns(3)
                .allow_tool("Read")
                .build(),
        )
        .unwrap();

    let (_request, mut stream) = h.manager.execute(session, "hello", DEADLINE).unwrap();

    let mut engine = h.engines.recv().await.unwrap();
    assert_eq!(engine.config.max_turns, 3);
    assert!(engine.config.allowed_tools.contains("Read"));
    let prompt: serde_json::Value =
        serde_json::from_str(&engine.next_prompt().await.unwrap()).unwrap();
    assert_eq!(prompt["type"], "user");
    assert_eq!(prompt["content"], "hello");

    engine
        .emit_json(serde_json::json!({"type": "text", "text": "hi"}))
        .await;
    engine.complete().await;

    let first = stream.recv().await.unwrap();
    assert!(matches!(first.payload, MessagePayload::Text { ref content } if content == "hi"));
    let terminal = stream.recv().await.unwrap();
    assert!(matches!(terminal.payload, MessagePayload::Complete { .. }));
    assert!(stream.recv().await.is_none());

    assert_eq!(h.metrics.counter(Counter::RequestsTotal), 1);
    assert_eq!(h.metrics.counter(Counter::RequestsFailedTotal), 0);

    // The session is back in the pool, idle.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = h.manager.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.checked_out, 0);
}

#[tokio::test]
async fn backpressure_drops_the_oldest() {
    let mut h = harness(Settings::default());
    let session = h.manager.create(SessionConfig::default()).unwrap();
    let (request, primary) = h.manager.execute(session, "go", DEADLINE).unwrap();
    let small = h
        .manager
        .subscribe(request, BackpressurePolicy::DropOldest, 2)
        .unwrap();

    let mut engine = h.engines.recv().await.unwrap();
    let _ = engine.next_prompt().await;
    for i in 0..5 {
        engine.text(&format!("t{i}")).await;
    }
    engine.complete().await;

    // The wide primary saw everything.
    let all = primary.collect().await;
    assert_eq!(all.len(), 6);

    // Capacity 2 retained the last two texts; the terminal always arrives.
    assert_eq!(small.dropped_oldest(), 3);
    let got = small.collect().await;
    let contents: Vec<String> = got
        .iter()
        .map(|m| match &m.payload {
            MessagePayload::Text { content } => content.clone(),
            other => format!("<{}>", if other.is_terminal() { "end" } else { "?" }),
        })
        .collect();
    assert_eq!(contents, ["t3", "t4", "<end>"]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_is_bounded_and_invalidates_the_session() {
    let mut h = harness(Settings::default());
    h.spawner.set_default_behavior(MockBehavior::unresponsive());
    let session = h.manager.create(SessionConfig::default()).unwrap();

    let (request, stream) = h
        .manager
        .execute(session, "long task", Duration::from_secs(60))
        .unwrap();
    let mut engine = h.engines.recv().await.unwrap();
    let _ = engine.next_prompt().await;
    engine.text("working...").await;

    let started = tokio::time::Instant::now();
    h.manager.cancel(request).unwrap();

    let messages = stream.collect().await;
    assert!(matches!(
        messages.last().unwrap().payload,
        MessagePayload::Cancelled {
            reason: CancelReason::Caller
        }
    ));
    // cancel grace (2 s) + force (1 s) bound.
    assert!(started.elapsed() <= Duration::from_secs(3) + Duration::from_millis(200));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.available_permits(), 10, "permit must be released");
    assert_eq!(h.manager.active_requests(), 0);
    assert_eq!(h.manager.stats().size, 0, "session must be invalidated");
    assert_eq!(h.metrics.counter(Counter::SessionsDestroyedTotal), 1);
}

#[tokio::test(start_paused = true)]
async fn circuit_trips_and_recovers() {
    let mut settings = Settings::default();
    settings.retry.max_attempts = 1;
    let mut h = harness(settings);
    let session = h.manager.create(SessionConfig::default()).unwrap();

    // Five consecutive crashes on the key trip the default threshold.
    for _ in 0..5 {
        let (_request, stream) = h.manager.execute(session, "boom", DEADLINE).unwrap();
        let engine = h.engines.recv().await.unwrap();
        engine.exit(Some(1)).await;
        let messages = stream.collect().await;
        assert!(matches!(
            messages.last().unwrap().payload,
            MessagePayload::Error {
                kind: ErrorKind::ProcessCrashed,
                ..
            }
        ));
    }
    assert_eq!(
        h.events
            .count(|e| matches!(e, LifecycleEvent::CircuitOpened { .. })),
        1
    );

    // While open, admission fails synchronously.
    let err = h.manager.execute(session, "again", DEADLINE).unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { .. }));

    // After the open window, a single probe is admitted; its success closes
    // the circuit.
    tokio::time::sleep(Duration::from_secs(31)).await;
    let (_request, stream) = h.manager.execute(session, "probe", DEADLINE).unwrap();
    let mut engine = h.engines.recv().await.unwrap();
    let _ = engine.next_prompt().await;
    engine.complete().await;
    assert!(matches!(
        stream.collect().await.last().unwrap().payload,
        MessagePayload::Complete { .. }
    ));
    assert_eq!(
        h.events
            .count(|e| matches!(e, LifecycleEvent::CircuitClosed { .. })),
        1
    );

    // Traffic flows again, reusing the recovered session.
    let (_request, stream) = h.manager.execute(session, "after", DEADLINE).unwrap();
    let _ = engine.next_prompt().await;
    engine.complete().await;
    assert!(stream.collect().await.last().unwrap().is_terminal());
}

#[tokio::test]
async fn pool_reuse_vs_recreate() {
    let mut h = harness(Settings::default());
    let session = h
        .manager
        .create(SessionConfig::builder().working_dir("/ws").build())
        .unwrap();

    let (_r1, stream) = h.manager.execute(session, "one", DEADLINE).unwrap();
    let mut engine = h.engines.recv().await.unwrap();
    let _ = engine.next_prompt().await;
    engine.complete().await;
    assert!(stream.collect().await.last().unwrap().is_terminal());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Same key: the idle session is reused, no second spawn.
    let (_r2, stream) = h.manager.execute(session, "two", DEADLINE).unwrap();
    let prompt: serde_json::Value =
        serde_json::from_str(&engine.next_prompt().await.unwrap()).unwrap();
    assert_eq!(prompt["content"], "two");
    engine.complete().await;
    assert!(stream.collect().await.last().unwrap().is_terminal());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = h.manager.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(h.spawner.spawn_count(), 1);

    // A different system prompt is a different key: a second engine is
    // spawned while the first stays idle.
    let other = h
        .manager
        .create(
            SessionConfig::builder()
                .working_dir("/ws")
                .system_prompt("terse")
                .build(),
        )
        .unwrap();
    let (_r3, stream) = h.manager.execute(other, "three", DEADLINE).unwrap();
    let mut engine2 = h.engines.recv().await.unwrap();
    let _ = engine2.next_prompt().await;
    engine2.complete().await;
    assert!(stream.collect().await.last().unwrap().is_terminal());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = h.manager.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(h.spawner.spawn_count(), 2);
}

#[tokio::test]
async fn auth_failure_is_not_retried_and_poisons_the_session() {
    let mut h = harness(Settings::default());
    let session = h.manager.create(SessionConfig::default()).unwrap();

    let (_request, stream) = h.manager.execute(session, "hello", DEADLINE).unwrap();
    let engine = h.engines.recv().await.unwrap();
    engine.write_stderr("Authentication failed: invalid token");
    engine.exit(Some(1)).await;

    let messages = stream.collect().await;
    assert!(matches!(
        messages.last().unwrap().payload,
        MessagePayload::Error {
            kind: ErrorKind::AuthFailed,
            ..
        }
    ));
    // Three attempts were allowed; none were taken.
    assert_eq!(h.spawner.spawn_count(), 1);
    assert_eq!(
        h.events.count(|e| matches!(
            e,
            LifecycleEvent::RequestFailed {
                kind: ErrorKind::AuthFailed,
                ..
            }
        )),
        1
    );

    // The session is gone; the same key spawns a fresh process.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.manager.stats().size, 0);
    let (_r2, stream) = h.manager.execute(session, "hello again", DEADLINE).unwrap();
    let mut engine2 = h.engines.recv().await.unwrap();
    let _ = engine2.next_prompt().await;
    engine2.complete().await;
    assert!(stream.collect().await.last().unwrap().is_terminal());
    assert_eq!(h.spawner.spawn_count(), 2);
}

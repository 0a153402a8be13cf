//! End-to-end scenarios exercising publish and transact through the full
//! stack: registry validation, executor dispatch, store persistence, worker
//! retries, and completion fan-out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::bus::{Bus, EventDraft, PublishOpts};
use crate::envelope::{Envelope, EventType};
use crate::error::{BusError, TxError};
use crate::executor::DispatchMode;
use crate::listener::SubscribeOpts;
use crate::schema::{accept_any, Schema, SchemaRegistry};
use crate::store::{PayloadFormat, TxStoreConfig};

const WAIT: Duration = Duration::from_secs(2);

fn registry(event_types: &[&str]) -> SchemaRegistry {
    let mut builder = SchemaRegistry::builder();
    for event_type in event_types {
        builder = builder.register_arc(*event_type, "1.0", accept_any());
    }
    builder.build()
}

async fn bus_with_memory_store(event_types: &[&str]) -> Bus {
    Bus::builder()
        .schema_registry(registry(event_types))
        .tx_store(TxStoreConfig::memory())
        .poll_interval(Duration::from_millis(10))
        .build()
        .await
        .unwrap()
}

// =============================================================================
// Publish scenarios
// =============================================================================

#[tokio::test]
async fn test_basic_publish_invokes_handler_once() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .build()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    bus.subscribe(
        "test/event",
        move |_bus: Bus, env: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(env).unwrap();
                Ok(true)
            }
        },
        SubscribeOpts::default(),
    )
    .unwrap();

    let published = bus
        .publish("test/event", json!({"data": 42}), PublishOpts::module("m"))
        .unwrap();

    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.event_type().as_str(), "test/event");
    assert_eq!(received.payload(), &json!({"data": 42}));
    assert_eq!(received.module().as_str(), "m");
    assert_eq!(received.correlation_id(), published.correlation_id());
    assert_ne!(*received.correlation_id().as_uuid(), uuid::Uuid::nil());

    // Exactly once.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
    bus.close(None).await;
}

#[tokio::test]
async fn test_cycle_detected_across_two_subscribers() {
    let bus = Bus::builder()
        .schema_registry(registry(&["ping", "pong"]))
        .max_depth(2)
        .build()
        .await
        .unwrap();

    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<BusError>();

    // ping handler republishes pong, derived from its envelope.
    bus.subscribe(
        "ping",
        |bus: Bus, env: Envelope| async move {
            bus.publish(
                "pong",
                json!({}),
                PublishOpts::module("loop").with_parent(&env),
            )?;
            Ok(true)
        },
        SubscribeOpts::default(),
    )
    .unwrap();

    // pong handler tries to republish ping, which closes the loop.
    bus.subscribe(
        "pong",
        move |bus: Bus, env: Envelope| {
            let errors_tx = errors_tx.clone();
            async move {
                let err = bus
                    .publish(
                        "ping",
                        json!({}),
                        PublishOpts::module("loop").with_parent(&env),
                    )
                    .unwrap_err();
                errors_tx.send(err).unwrap();
                Ok(true)
            }
        },
        SubscribeOpts::default(),
    )
    .unwrap();

    bus.publish("ping", json!({}), PublishOpts::module("loop"))
        .unwrap();

    let err = tokio::time::timeout(WAIT, errors_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, BusError::CycleDetected { .. }));
    bus.close(None).await;
}

#[tokio::test]
async fn test_buffered_backpressure_raises_buffer_full() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .mode(DispatchMode::Buffered {
            buffer_size: 1,
            concurrency: 1,
        })
        .build()
        .await
        .unwrap();

    let started = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    {
        let started = started.clone();
        let gate = gate.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let started = started.clone();
                let gate = gate.clone();
                async move {
                    started.notify_one();
                    let _permit = gate.acquire().await?;
                    Ok(true)
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    // #1 is taken by the single worker and blocks inside the handler.
    bus.publish("test/event", json!({"n": 1}), PublishOpts::module("m"))
        .unwrap();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();

    // #2 queues, filling the buffer.
    bus.publish("test/event", json!({"n": 2}), PublishOpts::module("m"))
        .unwrap();

    // #3 is rejected.
    let err = bus
        .publish("test/event", json!({"n": 3}), PublishOpts::module("m"))
        .unwrap_err();
    assert!(matches!(err, BusError::BufferFull));

    // Release both blocked handler invocations; close drains the queue.
    gate.add_permits(2);
    bus.close(None).await;
}

#[tokio::test]
async fn test_publish_invalid_payload_raises_and_skips_handlers() {
    let require_data: Arc<dyn Schema> = Arc::new(|payload: &Value| {
        payload
            .get("data")
            .map(|_| ())
            .ok_or_else(|| "missing data".to_string())
    });
    let bus = Bus::builder()
        .schema_registry(
            SchemaRegistry::builder()
                .register_arc("test/event", "1.0", require_data)
                .build(),
        )
        .build()
        .await
        .unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    {
        let invocations = invocations.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    let err = bus
        .publish("test/event", json!({"wrong": 1}), PublishOpts::module("m"))
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaValidation { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    bus.close(None).await;
}

#[tokio::test]
async fn test_subscriber_schema_gates_only_that_handler() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .build()
        .await
        .unwrap();

    let picky_invocations = Arc::new(AtomicUsize::new(0));
    let open_invocations = Arc::new(AtomicUsize::new(0));
    {
        let picky_invocations = picky_invocations.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let picky_invocations = picky_invocations.clone();
                async move {
                    picky_invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
            SubscribeOpts::default()
                .with_schema(|payload: &Value| {
                    payload
                        .get("special")
                        .map(|_| ())
                        .ok_or_else(|| "not special".to_string())
                }),
        )
        .unwrap();
    }
    let (open_tx, mut open_rx) = mpsc::unbounded_channel::<()>();
    {
        let open_invocations = open_invocations.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let open_invocations = open_invocations.clone();
                let open_tx = open_tx.clone();
                async move {
                    open_invocations.fetch_add(1, Ordering::SeqCst);
                    open_tx.send(()).unwrap();
                    Ok(true)
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    bus.publish("test/event", json!({"plain": true}), PublishOpts::module("m"))
        .unwrap();

    tokio::time::timeout(WAIT, open_rx.recv()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(picky_invocations.load(Ordering::SeqCst), 0);
    assert_eq!(open_invocations.load(Ordering::SeqCst), 1);
    bus.close(None).await;
}

#[tokio::test]
async fn test_publish_handler_error_never_reaches_publisher() {
    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let failures_clone = failures.clone();
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .log_sink(move |_level: crate::log::LogLevel, event: &str, _fields: &Value| {
            failures_clone.lock().unwrap().push(event.to_string());
        })
        .build()
        .await
        .unwrap();

    bus.subscribe(
        "test/event",
        |_bus: Bus, _env: Envelope| async move { anyhow::bail!("handler exploded") },
        SubscribeOpts::default(),
    )
    .unwrap();

    // The publisher sees success regardless of the handler outcome.
    bus.publish("test/event", json!({}), PublishOpts::module("m"))
        .unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            if failures.lock().unwrap().iter().any(|e| e == "handler-failed") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    bus.close(None).await;
}

// =============================================================================
// Transact scenarios
// =============================================================================

#[tokio::test]
async fn test_transact_success_fulfills_promise_and_channel() {
    let bus = bus_with_memory_store(&["test/event"]).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    {
        let invocations = invocations.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    let mut handle = bus
        .transact(vec![EventDraft::new(
            "test/event",
            "m",
            json!({"ok": true}),
        )])
        .await
        .unwrap();
    let mut channel = handle.subscribe();

    let result = handle.wait_timeout(WAIT).await.unwrap();
    assert!(result.is_ok());
    assert_eq!(result.tx_id, handle.tx_id());

    // The channel view observes the identical value.
    let channel_result = tokio::time::timeout(WAIT, channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel_result, result);

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_retry_then_succeed() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .tx_store(TxStoreConfig::memory())
        .poll_interval(Duration::from_millis(10))
        .handler_max_retries(2)
        .handler_backoff(Duration::from_millis(10))
        .build()
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let attempts = attempts.clone();
                async move {
                    // False on the first attempt, true on the second.
                    Ok(attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 2)
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    let mut handle = bus
        .transact(vec![EventDraft::new("test/event", "m", json!({}))])
        .await
        .unwrap();
    let result = handle.wait_timeout(WAIT).await.unwrap();

    assert!(result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_always_false_runs_exactly_max_retries() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .tx_store(TxStoreConfig::memory())
        .poll_interval(Duration::from_millis(10))
        .handler_max_retries(3)
        .handler_backoff(Duration::from_millis(10))
        .build()
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    let mut handle = bus
        .transact(vec![EventDraft::new("test/event", "m", json!({}))])
        .await
        .unwrap();
    let result = handle.wait_timeout(WAIT).await.unwrap();

    assert!(!result.is_ok());
    assert_eq!(result.error, Some(TxError::HandlerFailed));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Terminal means terminal: no further attempts happen.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_handler_timeout() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .tx_store(TxStoreConfig::memory())
        .poll_interval(Duration::from_millis(10))
        .tx_handler_timeout(Duration::from_millis(10))
        .handler_max_retries(1)
        .build()
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    // The deadline already classified this attempt; the late
                    // value changes nothing.
                    Ok(true)
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    let mut handle = bus
        .transact(vec![EventDraft::new("test/event", "m", json!({}))])
        .await
        .unwrap();
    let result = handle.wait_timeout(WAIT).await.unwrap();

    assert!(!result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_without_subscribers_completes_ok() {
    let bus = bus_with_memory_store(&["test/event"]).await;

    let mut handle = bus
        .transact(vec![EventDraft::new("test/event", "m", json!({}))])
        .await
        .unwrap();
    let result = handle.wait_timeout(WAIT).await.unwrap();
    assert!(result.is_ok());
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_handler_exception_fails_after_retries() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .tx_store(TxStoreConfig::memory())
        .poll_interval(Duration::from_millis(10))
        .handler_max_retries(2)
        .handler_backoff(Duration::from_millis(10))
        .build()
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        bus.subscribe(
            "test/event",
            move |_bus: Bus, _env: Envelope| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("flaky dependency")
                }
            },
            SubscribeOpts::default(),
        )
        .unwrap();
    }

    let mut handle = bus
        .transact(vec![EventDraft::new("test/event", "m", json!({}))])
        .await
        .unwrap();
    let result = handle.wait_timeout(WAIT).await.unwrap();

    assert!(!result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_unsubscribed_handler_resolves_to_failure() {
    // A generous poll interval leaves room to unsubscribe before the worker
    // picks up the row.
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .tx_store(TxStoreConfig::memory())
        .poll_interval(Duration::from_millis(200))
        .build()
        .await
        .unwrap();

    let id = bus
        .subscribe(
            "test/event",
            |_bus: Bus, _env: Envelope| async move { Ok(true) },
            SubscribeOpts::default(),
        )
        .unwrap();

    let mut handle = bus
        .transact(vec![EventDraft::new("test/event", "m", json!({}))])
        .await
        .unwrap();
    bus.unsubscribe("test/event", id).unwrap();

    let result = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
    assert!(!result.is_ok());
    assert_eq!(result.error, Some(TxError::HandlerFailed));
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_validation_happens_before_store() {
    let bus = bus_with_memory_store(&["test/event"]).await;

    let err = bus
        .transact(vec![
            EventDraft::new("test/event", "m", json!({})),
            EventDraft::new("unknown/event", "m", json!({})),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaMissing { .. }));
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_multiple_events_and_handlers() {
    let bus = bus_with_memory_store(&["a/ev", "b/ev"]).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    for event_type in ["a/ev", "b/ev"] {
        for _ in 0..2 {
            let invocations = invocations.clone();
            bus.subscribe(
                event_type,
                move |_bus: Bus, _env: Envelope| {
                    let invocations = invocations.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(true)
                    }
                },
                SubscribeOpts::default(),
            )
            .unwrap();
        }
    }

    let mut handle = bus
        .transact(vec![
            EventDraft::new("a/ev", "m", json!({"n": 1})),
            EventDraft::new("b/ev", "m", json!({"n": 2})),
        ])
        .await
        .unwrap();
    let result = handle.wait_timeout(WAIT).await.unwrap();

    assert!(result.is_ok());
    // Two events, two handlers each.
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    bus.close(None).await;
}

#[tokio::test]
async fn test_transact_through_sqlite_backend() {
    let bus = Bus::builder()
        .schema_registry(registry(&["test/event"]))
        .tx_store(TxStoreConfig::sqlite(":memory:").with_payload_format(PayloadFormat::Text))
        .poll_interval(Duration::from_millis(10))
        .build()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    bus.subscribe(
        "test/event",
        move |_bus: Bus, env: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(env).unwrap();
                Ok(true)
            }
        },
        SubscribeOpts::default(),
    )
    .unwrap();

    let mut handle = bus
        .transact(vec![EventDraft::new(
            "test/event",
            "m",
            json!({"payload": {"nested": [1, 2, 3]}}),
        )])
        .await
        .unwrap();
    let result = handle.wait_timeout(WAIT).await.unwrap();
    assert!(result.is_ok());

    // The payload round-tripped through SQL text intact.
    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.payload(), &json!({"payload": {"nested": [1, 2, 3]}}));
    bus.close(None).await;
}

#[tokio::test]
async fn test_derived_publish_from_transacted_event() {
    // Handlers on the durable path receive a bus clone and can publish
    // follow-up events derived from the stored envelope.
    let bus = bus_with_memory_store(&["stored/ev", "derived/ev"]).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    bus.subscribe(
        "stored/ev",
        |bus: Bus, env: Envelope| async move {
            bus.publish(
                "derived/ev",
                json!({}),
                PublishOpts::module("follow-up").with_parent(&env),
            )?;
            Ok(true)
        },
        SubscribeOpts::default(),
    )
    .unwrap();
    bus.subscribe(
        "derived/ev",
        move |_bus: Bus, env: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(env).unwrap();
                Ok(true)
            }
        },
        SubscribeOpts::default(),
    )
    .unwrap();

    let mut handle = bus
        .transact(vec![EventDraft::new("stored/ev", "origin", json!({}))])
        .await
        .unwrap();
    assert!(handle.wait_timeout(WAIT).await.unwrap().is_ok());

    let derived = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(derived.causation_path().len(), 1);
    assert_eq!(derived.causation_path()[0].module.as_str(), "origin");
    bus.close(None).await;
}

#[tokio::test]
async fn test_listener_count_reflects_subscriptions() {
    let bus = bus_with_memory_store(&["test/event"]).await;
    let et = EventType::new("test/event");

    let ids: Vec<_> = (0..3)
        .map(|_| {
            bus.subscribe(
                "test/event",
                |_bus: Bus, _env: Envelope| async move { Ok(true) },
                SubscribeOpts::default(),
            )
            .unwrap()
        })
        .collect();
    assert_eq!(bus.listener_count(Some(&et)), 3);

    bus.unsubscribe("test/event", ids[1]).unwrap();
    assert_eq!(bus.listener_count(Some(&et)), 2);

    bus.clear_listeners(Some(&et)).unwrap();
    assert_eq!(bus.listener_count(None), 0);
    bus.close(None).await;
}

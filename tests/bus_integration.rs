//! End-to-end bus scenarios: command dispatch, expiry, event fan-out,
//! query caching, and dead-letter replay

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};
use switchyard::bus::{CallContext, HandlerOptions, MessageBus};
use switchyard::config::BusConfig;
use switchyard::error::{BusError, FailureReason};
use switchyard::message::{Command, Envelope, Event, Query, command_envelope};
use switchyard::metrics::AtomicMetrics;
use switchyard::time_provider::test_time_provider;

#[derive(Debug, Serialize, Deserialize)]
struct AddTodo {
    text: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct TodoAdded {
    id: u64,
}

impl Command for AddTodo {
    type Response = TodoAdded;
    const TYPE: &'static str = "todos.add";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    id: u64,
}

impl Event for OrderPlaced {
    const TYPE: &'static str = "orders.placed";

    fn aggregate_id(&self) -> Option<String> {
        Some(format!("order-{}", self.id))
    }

    fn aggregate_version(&self) -> Option<u64> {
        Some(1)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TodoStats {
    owner: String,
}

impl Query for TodoStats {
    type Output = u64;
    const TYPE: &'static str = "todos.stats";

    fn cache_key(&self) -> Option<String> {
        Some(self.owner.clone())
    }

    fn cache_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }
}

async fn bus_with_metrics() -> (MessageBus, Arc<AtomicMetrics>) {
    let metrics = Arc::new(AtomicMetrics::new());
    let bus = MessageBus::builder(BusConfig::default())
        .with_metrics(metrics.clone())
        .with_time_provider(test_time_provider())
        .build()
        .await
        .unwrap();
    (bus, metrics)
}

#[tokio::test]
async fn command_success_scenario() {
    let (bus, metrics) = bus_with_metrics().await;
    let _sub = bus
        .subscribe_command(|cmd: AddTodo| async move {
            assert_eq!(cmd.text, "buy milk");
            Ok(TodoAdded { id: 42 })
        })
        .unwrap();

    let response = bus
        .send(&AddTodo {
            text: "buy milk".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(response, TodoAdded { id: 42 });
    assert_eq!(metrics.counter("command.success"), 1);
    assert_eq!(metrics.counter("command.error"), 0);
}

#[tokio::test]
async fn command_expiry_scenario() {
    let (bus, metrics) = bus_with_metrics().await;
    let invoked = Arc::new(AtomicU32::new(0));
    let invoked2 = invoked.clone();
    let _sub = bus
        .subscribe_command(move |_cmd: AddTodo| {
            let invoked = invoked2.clone();
            async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(TodoAdded { id: 1 })
            }
        })
        .unwrap();

    let mut envelope = command_envelope(&AddTodo {
        text: "stale".to_string(),
    })
    .unwrap();
    envelope.timestamp = SystemTime::now() - Duration::from_secs(10);
    envelope.ttl = Some(Duration::from_secs(5));

    let result = bus.dispatch(envelope, CallContext::default()).await;
    assert!(matches!(result, Err(BusError::Expired { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.counter("command.expired"), 1);

    let dead = bus.dead_letters().iterate(|_| true);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, FailureReason::Expired);
}

#[tokio::test]
async fn event_fan_out_partial_failure_scenario() {
    let (bus, metrics) = bus_with_metrics().await;
    let runs = Arc::new(AtomicU32::new(0));

    for name in ["h1", "h3"] {
        let runs = runs.clone();
        bus.subscribe_event_with(HandlerOptions::named(name), move |_evt: OrderPlaced| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap()
        .detach();
    }
    bus.subscribe_event_with(HandlerOptions::named("h2"), |_evt: OrderPlaced| async {
        Err(anyhow::anyhow!("h2 exploded"))
    })
    .unwrap()
    .detach();

    let report = bus.publish(&OrderPlaced { id: 1 }).await.unwrap();

    assert_eq!(report.handler_count, 3);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].handler, "h2");
    assert_eq!(metrics.counter("event.publish.partial_failure"), 1);

    let dead = bus.dead_letters().iterate(|_| true);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, FailureReason::HandlerError);
    assert!(dead[0].last_error.contains("h2"));

    // The composite error view carries the breakdown.
    let composite = report.into_error().unwrap();
    assert_eq!(composite.handler_count, 3);
}

#[tokio::test]
async fn event_envelope_carries_aggregate_identity() {
    let envelope = switchyard::message::event_envelope(&OrderPlaced { id: 5 }).unwrap();
    assert_eq!(envelope.aggregate_id.as_deref(), Some("order-5"));
    assert_eq!(envelope.aggregate_version, Some(1));
    envelope.validate().unwrap();
}

#[tokio::test]
async fn query_cache_hits_skip_the_handler() {
    let (bus, metrics) = bus_with_metrics().await;
    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = calls.clone();
    let _sub = bus
        .subscribe_query(move |_q: TodoStats| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7u64)
            }
        })
        .unwrap();

    let q = TodoStats {
        owner: "ada".to_string(),
    };
    assert_eq!(bus.query(&q).await.unwrap(), 7);
    assert_eq!(bus.query(&q).await.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.counter("query.cache_hit"), 1);
    assert_eq!(metrics.counter("query.cache_miss"), 1);
}

#[tokio::test]
async fn untyped_dispatch_switches_on_category() {
    let (bus, _) = bus_with_metrics().await;
    let _cmd = bus
        .subscribe_command(|_c: AddTodo| async { Ok(TodoAdded { id: 11 }) })
        .unwrap();
    let seen = Arc::new(AtomicU32::new(0));
    let seen2 = seen.clone();
    bus.subscribe_event(move |_e: OrderPlaced| {
        let seen = seen2.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap()
    .detach();

    let command = command_envelope(&AddTodo {
        text: "x".to_string(),
    })
    .unwrap();
    let response = bus
        .dispatch(command, CallContext::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response["id"], serde_json::json!(11));

    let event = switchyard::message::event_envelope(&OrderPlaced { id: 2 }).unwrap();
    let response = bus.dispatch(event, CallContext::default()).await.unwrap();
    assert!(response.is_none());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn correlation_chain_is_walkable() {
    let (bus, _) = bus_with_metrics().await;
    let _sub = bus
        .subscribe_command(|_c: AddTodo| async { Ok(TodoAdded { id: 1 }) })
        .unwrap();

    let parent = command_envelope(&AddTodo {
        text: "first".to_string(),
    })
    .unwrap();
    let child = parent.child(
        command_envelope(&AddTodo {
            text: "second".to_string(),
        })
        .unwrap(),
    );
    let grandchild = child.child(
        command_envelope(&AddTodo {
            text: "third".to_string(),
        })
        .unwrap(),
    );
    let grandchild_id = grandchild.id;

    for envelope in [parent.clone(), child.clone(), grandchild] {
        bus.dispatch(envelope, CallContext::default()).await.unwrap();
    }

    let ancestry = bus.correlator().ancestry(grandchild_id);
    assert_eq!(ancestry, vec![child.id, parent.id]);
}

#[tokio::test]
async fn rejected_admission_is_not_dead_lettered() {
    let metrics = Arc::new(AtomicMetrics::new());
    let config = BusConfig {
        flow: switchyard::config::FlowConfig {
            max_in_flight: 1,
            ..switchyard::config::FlowConfig::default()
        },
        ..BusConfig::default()
    };
    let bus = MessageBus::builder(config)
        .with_metrics(metrics)
        .with_time_provider(test_time_provider())
        .build()
        .await
        .unwrap();

    let _sub = bus
        .subscribe_command(|_c: AddTodo| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(TodoAdded { id: 1 })
        })
        .unwrap();

    let blocker = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.send(&AddTodo {
                text: "slow".to_string(),
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut envelope = command_envelope(&AddTodo {
        text: "fast".to_string(),
    })
    .unwrap();
    envelope.non_blocking = true;
    let result = bus.dispatch(envelope, CallContext::default()).await;
    assert!(matches!(result, Err(BusError::Rejected { .. })));
    assert_eq!(bus.dead_letters().len(), 0);

    blocker.await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_timeout_cancels_and_dead_letters() {
    let (bus, metrics) = bus_with_metrics().await;
    let _sub = bus
        .subscribe_command_with(
            HandlerOptions::named("sleepy").with_timeout(Duration::from_millis(50)),
            |_c: AddTodo| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(TodoAdded { id: 1 })
            },
        )
        .unwrap();

    let result = bus
        .send(&AddTodo {
            text: "zzz".to_string(),
        })
        .await;
    assert!(matches!(result, Err(BusError::Timeout { .. })));
    assert_eq!(metrics.counter("command.error"), 1);

    let dead = bus.dead_letters().iterate(|_| true);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, FailureReason::Timeout);
}

#[tokio::test]
async fn envelope_priority_survives_round_trip() {
    let envelope = Envelope::command("x.y", serde_json::json!({}))
        .unwrap()
        .with_priority(switchyard::domain_types::MessagePriority::try_new(7).unwrap());
    let json = serde_json::to_string(&envelope).unwrap();
    let decoded: Envelope = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded.priority, envelope.priority);
    assert_eq!(decoded.id, envelope.id);
}

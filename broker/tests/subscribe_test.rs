// End-to-end subscriber pipeline tests against the scripted mock driver:
// handler-chain signalling, acknowledgement semantics, dead-lettering and
// the codec content-type matrix.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use broker::testing::{MockConnection, MockDriver};
use broker::{Broker, BrokerConfig, BrokerError, Content, MessageProperties, Next, handler};
use parking_lot::Mutex;
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("broker=debug").try_init();
}

fn broker_with(config: serde_json::Value, driver: &MockDriver) -> Broker {
    let config: BrokerConfig = serde_json::from_value(config).unwrap();
    Broker::with_driver(config, Arc::new(driver.clone())).unwrap()
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn acked(connection: &Arc<MockConnection>) -> Vec<u64> {
    connection.channels().iter().flat_map(|channel| channel.acked()).collect()
}

fn nacked(connection: &Arc<MockConnection>) -> Vec<(u64, bool)> {
    connection.channels().iter().flat_map(|channel| channel.nacked()).collect()
}

#[tokio::test]
async fn test_ack_on_handler_resolution() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let queue = broker.queue("jobs");
    let seen = handled.clone();
    queue
        .subscribe(vec![handler(move |_msg, _next| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })])
        .await
        .unwrap();

    queue.send(json!({ "job": 1 })).await.unwrap();

    wait_until("handler completion", || handled.load(Ordering::SeqCst) == 1).await;
    let connection = driver.current_connection().unwrap();
    wait_until("acknowledgement", || acked(&connection).len() == 1).await;

    // No redelivery follows a clean resolution.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(nacked(&connection).is_empty());
    assert_eq!(driver.server().unacked_count(), 0);
}

#[tokio::test]
async fn test_abort_signal_requeues_once_and_skips_downstream() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    let queue = broker.queue("jobs");
    let downstream_calls = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));

    let first = {
        let completions = completions.clone();
        handler(move |msg, next: Next| {
            let completions = completions.clone();
            async move {
                if !msg.redelivered {
                    next.abort();
                } else {
                    completions.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        })
    };
    let second = {
        let downstream_calls = downstream_calls.clone();
        handler(move |_msg, _next| {
            downstream_calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(()) }
        })
    };
    queue.subscribe(vec![first, second]).await.unwrap();

    queue.send(json!({ "attempt": 1 })).await.unwrap();

    wait_until("redelivered completion", || completions.load(Ordering::SeqCst) == 1).await;
    let connection = driver.current_connection().unwrap();

    // First delivery nacked with requeue (no dead-letter exchange), second
    // delivery acked; the downstream handler never ran.
    assert_eq!(downstream_calls.load(Ordering::SeqCst), 0);
    let nacks = nacked(&connection);
    assert_eq!(nacks.len(), 1);
    assert!(nacks[0].1, "expected requeue on a queue without a DLX");
    wait_until("final acknowledgement", || acked(&connection).len() == 1).await;
}

#[tokio::test]
async fn test_thrown_handler_dead_letters_with_payload_intact() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(
        json!({
            "connection": "amqp://solo",
            "exchanges": { "dlx": { "fanout": ["dead"] } },
            "queues": { "jobs": { "deadLetterExchange": "dlx" }, "dead": {} },
        }),
        &driver,
    );
    broker.connect().await.unwrap();

    let queue = broker.queue("jobs");
    queue
        .subscribe(vec![handler(|_msg, _next| async move { anyhow::bail!("handler exploded") })])
        .await
        .unwrap();

    queue.send(json!({ "foo": "bar" })).await.unwrap();

    let server = driver.server();
    wait_until("dead-lettered message", || !server.queue_messages("dead").is_empty()).await;

    let dead = server.queue_messages("dead");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload.as_ref(), br#"{"foo":"bar"}"#);
    assert_eq!(dead[0].properties.content_type.as_deref(), Some("application/json"));

    let connection = driver.current_connection().unwrap();
    let nacks = nacked(&connection);
    assert_eq!(nacks.len(), 1);
    assert!(!nacks[0].1, "expected no requeue on a queue with a DLX");
}

#[tokio::test]
async fn test_content_type_matrix_round_trip() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    let received: Arc<Mutex<Vec<(Content, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let queue = broker.queue("payloads");
    let sink = received.clone();
    queue
        .subscribe(vec![handler(move |msg, _next| {
            sink.lock().push((msg.content.clone(), msg.properties.content_type.clone()));
            async move { Ok(()) }
        })])
        .await
        .unwrap();

    // A struct payload is JSON-encoded and tagged application/json.
    queue.send(json!({ "foo": "bar" })).await.unwrap();
    wait_until("first delivery", || received.lock().len() == 1).await;

    // A pre-encoded buffer passes through with no content type.
    queue.send(br#"{"foo":"bar"}"#.to_vec()).await.unwrap();
    wait_until("second delivery", || received.lock().len() == 2).await;

    // A struct payload with an overriding content type still carries JSON
    // bytes but keeps the caller's tag.
    queue
        .send_with(json!({ "foo": "bar" }), MessageProperties::default().with_content_type("text/plain"))
        .await
        .unwrap();
    wait_until("third delivery", || received.lock().len() == 3).await;

    let received = received.lock();
    assert_eq!(received[0].0, Content::Json(json!({ "foo": "bar" })));
    assert_eq!(received[0].1.as_deref(), Some("application/json"));

    match &received[1].0 {
        Content::Raw(bytes) => assert_eq!(bytes.as_ref(), br#"{"foo":"bar"}"#),
        other => panic!("expected raw content, got {other:?}"),
    }
    assert_eq!(received[1].1, None);

    match &received[2].0 {
        Content::Raw(bytes) => assert_eq!(bytes.as_ref(), br#"{"foo":"bar"}"#),
        other => panic!("expected raw content, got {other:?}"),
    }
    assert_eq!(received[2].1.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn test_publish_defaults_are_injected() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    let properties: Arc<Mutex<Option<MessageProperties>>> = Arc::new(Mutex::new(None));
    let queue = broker.queue("stamped");
    let sink = properties.clone();
    queue
        .subscribe(vec![handler(move |msg, _next| {
            *sink.lock() = Some(msg.properties.clone());
            async move { Ok(()) }
        })])
        .await
        .unwrap();

    queue.send(json!({ "n": 1 })).await.unwrap();
    wait_until("delivery", || properties.lock().is_some()).await;

    let properties = properties.lock().clone().unwrap();
    assert_eq!(properties.message_id.map(|id| id.len()), Some(21));
    assert!(properties.timestamp.unwrap_or_default() > 0);
    assert!(properties.app_id.unwrap_or_default().contains(':'));
}

#[tokio::test]
async fn test_explicit_ack_wins_over_chain_failure() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    let queue = broker.queue("jobs");
    queue
        .subscribe(vec![handler(|msg, next: Next| async move {
            msg.ack().await?;
            next.fail(anyhow::anyhow!("too late to matter"));
            Ok(())
        })])
        .await
        .unwrap();

    queue.send(json!({ "job": 1 })).await.unwrap();

    let connection = driver.current_connection().unwrap();
    wait_until("explicit acknowledgement", || acked(&connection).len() == 1).await;

    // The chain failure settles against an already-settled acker: no nack,
    // no redelivery.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(nacked(&connection).is_empty());
    assert_eq!(acked(&connection).len(), 1);
}

#[tokio::test]
async fn test_second_subscribe_is_a_conflict() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    let queue = broker.queue("jobs");
    queue.subscribe(vec![handler(|_msg, _next| async move { Ok(()) })]).await.unwrap();

    let err = queue.subscribe(vec![handler(|_msg, _next| async move { Ok(()) })]).await.unwrap_err();
    assert!(matches!(err, BrokerError::SubscriptionConflict));
    assert_eq!(err.to_string(), "A consumer already exists for that queue in that context");
}

#[tokio::test]
async fn test_cancel_stops_delivery_and_frees_the_queue() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let queue = broker.queue("jobs");
    let counter = delivered.clone();
    queue
        .subscribe(vec![handler(move |_msg, _next| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(()) }
        })])
        .await
        .unwrap();

    queue.cancel().await.unwrap();
    queue.send(json!({ "parked": true })).await.unwrap();

    // The message parks in the queue instead of reaching the old consumer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(driver.server().queue_messages("jobs").len(), 1);

    // A fresh subscription picks up the backlog.
    let counter = delivered.clone();
    queue
        .subscribe(vec![handler(move |_msg, _next| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(()) }
        })])
        .await
        .unwrap();
    wait_until("backlog delivery", || delivered.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_prefetch_is_one_on_the_read_channel() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);
    broker.connect().await.unwrap();

    broker.queue("jobs").assert().await.unwrap();

    let connection = driver.current_connection().unwrap();
    let prefetches: Vec<_> =
        connection.channels().iter().filter_map(|channel| channel.prefetch_count()).collect();
    assert_eq!(prefetches, [1]);
}

#[tokio::test]
async fn test_topic_publish_reaches_bound_queue() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(
        json!({
            "connection": "amqp://solo",
            "exchanges": { "events": { "topics": { "user.#": "audit" } } },
            "queues": { "audit": {} },
        }),
        &driver,
    );
    broker.connect().await.unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let queue = broker.queue("audit");
    let counter = received.clone();
    queue
        .subscribe(vec![handler(move |msg, _next| {
            let counter = counter.clone();
            async move {
                assert_eq!(msg.routing_key, "user.created");
                assert_eq!(msg.content_as::<serde_json::Value>()?, json!({ "id": 7 }));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })])
        .await
        .unwrap();

    broker.exchange("events").publish("user.created", json!({ "id": 7 })).await.unwrap();
    broker.exchange("events").publish("billing.settled", json!({ "id": 8 })).await.unwrap();

    wait_until("matched delivery", || received.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1, "unmatched routing key must not deliver");
}

#[tokio::test]
async fn test_empty_queue_name_takes_server_generated_name() {
    let driver = MockDriver::new();
    let broker = broker_with(
        json!({ "connection": "amqp://solo", "queues": { "transient": { "name": "", "exclusive": true } } }),
        &driver,
    );
    broker.connect().await.unwrap();

    let queue = broker.queue("transient");
    queue.assert().await.unwrap();
    assert!(queue.name().starts_with("amq.gen-"));
}

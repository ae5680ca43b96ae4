// Integration tests for cluster connection management, driven by the
// scripted mock driver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::testing::MockDriver;
use broker::{Broker, BrokerConfig, BrokerError};
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

#[tokio::test]
async fn test_connect_dials_the_first_node() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://one,amqp://two" }), &driver);

    broker.connect().await.unwrap();

    assert!(broker.connected());
    assert_eq!(driver.dialed_hosts(), ["one"]);
}

#[tokio::test]
async fn test_connect_is_idempotent_while_connected() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);

    broker.connect().await.unwrap();
    broker.connect().await.unwrap();

    assert_eq!(driver.dial_count(), 1);
}

#[tokio::test]
async fn test_round_robin_cycles_nodes_in_declaration_order() {
    let driver = MockDriver::new();
    driver.refuse_all(true);
    let broker = broker_with(json!({ "connection": "amqp://a,amqp://b,amqp://c" }), &driver);

    let err = broker.connect_with(1, Duration::ZERO).await.unwrap_err();

    assert!(matches!(err, BrokerError::ConnectExhausted { .. }));
    assert_eq!(driver.dialed_hosts(), ["a", "b", "c", "a", "b", "c"]);
}

#[tokio::test]
async fn test_bounded_retry_dial_count_and_pacing() {
    let driver = MockDriver::new();
    driver.refuse_all(true);
    let broker = broker_with(json!({ "connection": "amqp://unreachable" }), &driver);

    let started = Instant::now();
    let err = broker.connect_with(5, Duration::from_millis(20)).await.unwrap_err();

    // retry + 1 cluster passes over a single node.
    assert_eq!(driver.dial_count(), 6);
    assert!(started.elapsed() >= Duration::from_millis(100));
    match err {
        BrokerError::ConnectExhausted { attempts, source } => {
            assert_eq!(attempts, 6);
            assert!(source.to_string().contains("connection refused"));
        }
        other => panic!("expected ConnectExhausted, got {other}"),
    }
}

#[tokio::test]
async fn test_zero_retry_fails_after_one_pass() {
    let driver = MockDriver::new();
    driver.refuse_all(true);
    let broker = broker_with(json!({ "connection": "amqp://a,amqp://b" }), &driver);

    let err = broker.connect_with(0, Duration::ZERO).await.unwrap_err();

    assert!(matches!(err, BrokerError::ConnectExhausted { .. }));
    assert_eq!(driver.dial_count(), 2);
}

#[tokio::test]
async fn test_cluster_reconnect_resumes_round_robin_after_drop() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(
        json!({ "connection": {
            "nodes": "amqp://n1:5001,amqp://n2:5002,amqp://n3:5003",
            "retry": 5,
            "frequency": 10,
        } }),
        &driver,
    );

    broker.connect().await.unwrap();
    assert_eq!(driver.dialed_ports(), [5001]);

    // The next six dials are refused, so reconnection walks the cluster
    // twice before the eighth dial lands back on the first node.
    driver.refuse_next(6);
    driver.kill_connection();

    wait_until("reconnection", || broker.connected() && driver.dial_count() == 8).await;
    assert_eq!(driver.dialed_ports(), [5001, 5001, 5002, 5003, 5001, 5002, 5003, 5001]);
}

#[tokio::test]
async fn test_user_close_wins_over_reconnection() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);

    broker.connect().await.unwrap();
    broker.close().await.unwrap();

    assert!(!broker.connected());
    assert!(matches!(broker.connection(), Err(BrokerError::NotConnected)));

    // No reconnect attempt fires for a user-initiated close.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.dial_count(), 1);
}

#[tokio::test]
async fn test_close_then_connect_reuses_registered_channels() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);

    broker.connect().await.unwrap();
    let channel = broker.channel("audit");
    channel.connect().await.unwrap();

    broker.close().await.unwrap();
    assert!(!channel.connected());

    broker.connect().await.unwrap();
    wait_until("channel resurrection", || channel.connected()).await;
}

#[tokio::test]
async fn test_channel_self_heals_on_spontaneous_close() {
    init_tracing();
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);

    broker.connect().await.unwrap();
    let channel = broker.channel("write");
    channel.connect().await.unwrap();

    let connection = driver.current_connection().unwrap();
    assert_eq!(connection.channels().len(), 1);
    connection.channels()[0].kill();

    wait_until("channel self-heal", || channel.connected()).await;
    // Reopened on the same connection, no redial.
    assert_eq!(connection.channels().len(), 2);
    assert_eq!(driver.dial_count(), 1);
}

#[tokio::test]
async fn test_user_closed_channel_stays_closed() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": "amqp://solo" }), &driver);

    broker.connect().await.unwrap();
    let channel = broker.channel("write");
    channel.connect().await.unwrap();
    channel.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!channel.connected());
    assert!(matches!(channel.underlying(), Err(BrokerError::ChannelNotOpen)));
    assert_eq!(driver.current_connection().unwrap().channels().len(), 1);
}

#[tokio::test]
async fn test_channels_resurrect_after_reconnect() {
    let driver = MockDriver::new();
    let broker = broker_with(json!({ "connection": { "nodes": "amqp://solo", "retry": 5, "frequency": 5 } }), &driver);

    broker.connect().await.unwrap();
    let channel = broker.channel("events");
    channel.connect().await.unwrap();

    driver.kill_connection();

    wait_until("reconnect with channel", || broker.connected() && channel.connected()).await;
    assert!(driver.dial_count() >= 2);
}

#[tokio::test]
async fn test_topology_reasserted_on_every_connect() {
    let driver = MockDriver::new();
    let broker = broker_with(
        json!({
            "connection": { "nodes": "amqp://solo", "retry": 5, "frequency": 5 },
            "exchanges": { "events": { "topics": { "user.#": "audit" } } },
            "queues": { "audit": {} },
        }),
        &driver,
    );

    broker.connect().await.unwrap();
    let server = driver.server();
    assert_eq!(server.exchange_declare_count("events"), 1);
    assert_eq!(server.queue_declare_count("audit"), 1);

    driver.kill_connection();
    wait_until("reconnect", || broker.connected()).await;
    wait_until("topology re-assert", || server.exchange_declare_count("events") == 2).await;
    assert_eq!(server.queue_declare_count("audit"), 2);
}

#[tokio::test]
async fn test_assert_is_idempotent_within_a_connection() {
    let driver = MockDriver::new();
    let broker = broker_with(
        json!({
            "connection": "amqp://solo",
            "exchanges": { "events": {} },
            "queues": { "audit": {} },
        }),
        &driver,
    );

    broker.connect().await.unwrap();
    broker.exchange("events").assert().await.unwrap();
    broker.queue("audit").assert().await.unwrap();

    let server = driver.server();
    assert_eq!(server.exchange_declare_count("events"), 1);
    assert_eq!(server.queue_declare_count("audit"), 1);
}

// tests/multiplexer.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, queue, CountingProvider, RecordingSink};
use mom_pubsub::{
    // ---
    create_memory_provider_with_broker,
    ConnectionId,
    MemoryBroker,
    Multiplexer,
    ProviderConfig,
    ProviderPtr,
    QueueError,
    QueueMessage,
    SubscribeOutcome,
};
use tokio::time::timeout;

struct Fixture {
    broker: MemoryBroker,
    provider: Arc<CountingProvider>,
    sink: Arc<RecordingSink>,
    mux: Multiplexer,
}

async fn fixture() -> Fixture {
    // ---
    let broker = MemoryBroker::new();
    let inner = create_memory_provider_with_broker(&ProviderConfig::memory("mux-test"), broker.clone())
        .await
        .expect("memory provider");

    let provider = CountingProvider::new(inner);
    let sink = RecordingSink::new();
    let facade: ProviderPtr = provider.clone();
    let mux = Multiplexer::new(facade, sink.clone());

    Fixture {
        broker,
        provider,
        sink,
        mux,
    }
}

fn connect(mux: &Multiplexer, name: &str) -> ConnectionId {
    let conn = ConnectionId::from(name);
    mux.on_connect(&conn);
    conn
}

#[tokio::test]
async fn test_two_connections_each_receive_once() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let c2 = connect(&fx.mux, "c2");
    let orders = queue("orders");

    // --- Act
    assert_eq!(fx.mux.subscribe(&c1, &orders).await.expect("c1"), SubscribeOutcome::Subscribed);
    assert_eq!(fx.mux.subscribe(&c2, &orders).await.expect("c2"), SubscribeOutcome::Subscribed);
    fx.mux
        .publish(&orders, QueueMessage::new("hello").with_attribute("k", "v"))
        .await
        .expect("publish");

    // --- Assert
    assert!(eventually(2000, || fx.sink.total() == 2).await, "both connections should receive");
    assert_eq!(fx.provider.subscribes("orders"), 1);

    for conn in [&c1, &c2] {
        let got = fx.sink.deliveries_to(conn);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "hello");
        assert_eq!(got[0].attributes_or_empty().get("k").map(String::as_str), Some("v"));
        assert!(got[0].id.as_deref().is_some_and(|id| !id.is_empty()));
    }
}

#[tokio::test]
async fn test_unsubscribed_connection_stops_receiving() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let c2 = connect(&fx.mux, "c2");
    let orders = queue("orders");
    fx.mux.subscribe(&c1, &orders).await.expect("c1");
    fx.mux.subscribe(&c2, &orders).await.expect("c2");

    // --- Act
    fx.mux.unsubscribe(&c1, &orders).await;
    fx.mux.publish(&orders, QueueMessage::new("after")).await.expect("publish");

    // --- Assert
    assert!(eventually(2000, || fx.sink.deliveries_to(&c2).len() == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(fx.sink.deliveries_to(&c1).is_empty());
    assert_eq!(fx.provider.unsubscribes("orders"), 0, "c2 still holds the queue");
    assert_eq!(fx.broker.consumer_count(&orders), 1);
}

#[tokio::test]
async fn test_double_subscribe_is_idempotent() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let orders = queue("orders");

    // --- Act
    let first = fx.mux.subscribe(&c1, &orders).await.expect("first");
    let second = fx.mux.subscribe(&c1, &orders).await.expect("second");

    // --- Assert
    assert_eq!(first, SubscribeOutcome::Subscribed);
    assert_eq!(second, SubscribeOutcome::AlreadySubscribed);
    assert_eq!(second.describe(&orders), "Already subscribed to orders");
    assert_eq!(fx.provider.subscribes("orders"), 1);
    assert_eq!(fx.mux.registry().queues_of(&c1), vec![orders]);
}

#[tokio::test]
async fn test_unsubscribe_without_interest_is_noop() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let orders = queue("orders");

    // --- Act
    fx.mux.unsubscribe(&c1, &orders).await;
    fx.mux.unsubscribe(&ConnectionId::from("never-connected"), &orders).await;

    // --- Assert
    assert_eq!(fx.provider.unsubscribes("orders"), 0);
    assert!(fx.mux.registry().queues_of(&c1).is_empty());
}

#[tokio::test]
async fn test_last_leave_releases_provider_subscription_once() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let c2 = connect(&fx.mux, "c2");
    let orders = queue("orders");
    fx.mux.subscribe(&c1, &orders).await.expect("c1");
    fx.mux.subscribe(&c2, &orders).await.expect("c2");

    // --- Act
    fx.mux.unsubscribe(&c1, &orders).await;
    let after_first = fx.provider.unsubscribes("orders");
    fx.mux.unsubscribe(&c2, &orders).await;
    fx.mux.unsubscribe(&c2, &orders).await;

    // --- Assert
    assert_eq!(after_first, 0);
    assert_eq!(fx.provider.unsubscribes("orders"), 1);
    assert!(!fx.mux.registry().has_handler(&orders));
    assert_eq!(fx.broker.consumer_count(&orders), 0);
}

#[tokio::test]
async fn test_disconnect_releases_every_queue() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let c2 = connect(&fx.mux, "c2");
    let q1 = queue("q1");
    let q2 = queue("q2");
    fx.mux.subscribe(&c1, &q1).await.expect("q1");
    fx.mux.subscribe(&c1, &q2).await.expect("q2");
    fx.mux.subscribe(&c2, &q2).await.expect("c2 q2");

    // --- Act
    fx.mux.on_disconnect(&c1).await;
    fx.mux.on_disconnect(&c1).await;

    // --- Assert
    assert_eq!(fx.provider.unsubscribes("q1"), 1);
    assert_eq!(fx.provider.unsubscribes("q2"), 0, "c2 still wants q2");
    assert_eq!(fx.mux.registry().connection_count(), 1);

    fx.mux.on_disconnect(&c2).await;
    assert_eq!(fx.provider.unsubscribes("q2"), 1);
    assert!(fx.mux.registry().registered_queues().is_empty());
}

#[tokio::test]
async fn test_failed_provider_subscribe_leaves_state_unchanged() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let orders = queue("orders");
    fx.provider.fail_subscribe(true);

    // --- Act
    let err = fx.mux.subscribe(&c1, &orders).await.expect_err("subscribe must fail");

    // --- Assert
    assert!(matches!(err, QueueError::SubscribeFailed { .. }));
    assert!(fx.mux.registry().queues_of(&c1).is_empty());
    assert!(!fx.mux.registry().has_handler(&orders));

    // A retry after recovery registers normally.
    fx.provider.fail_subscribe(false);
    let outcome = fx.mux.subscribe(&c1, &orders).await.expect("retry");
    assert_eq!(outcome, SubscribeOutcome::Subscribed);
    assert_eq!(fx.provider.subscribes("orders"), 2);
}

#[tokio::test]
async fn test_broken_recipient_does_not_block_others() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let c2 = connect(&fx.mux, "c2");
    let orders = queue("orders");
    fx.mux.subscribe(&c1, &orders).await.expect("c1");
    fx.mux.subscribe(&c2, &orders).await.expect("c2");
    fx.sink.break_connection(&c1);

    // --- Act
    fx.mux.publish(&orders, QueueMessage::new("x")).await.expect("publish");

    // --- Assert
    assert!(eventually(2000, || fx.sink.deliveries_to(&c2).len() == 1).await);
    assert!(eventually(2000, || fx.sink.attempts() == 2).await);

    // Fan-out consumed the message; nothing goes back to the queue.
    assert!(eventually(2000, || fx.broker.stats().acked == 1).await);
    assert_eq!(fx.broker.stats().nacked, 0);
}

#[tokio::test]
async fn test_message_without_recipients_is_consumed() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let orders = queue("orders");
    fx.mux.subscribe(&c1, &orders).await.expect("c1");

    // Drop the interest behind the multiplexer's back so the handler stays.
    fx.mux.registry().remove_interest(&c1, &orders);

    // --- Act
    fx.mux.publish(&orders, QueueMessage::new("orphan")).await.expect("publish");

    // --- Assert
    assert!(eventually(2000, || fx.broker.stats().acked == 1).await);
    assert_eq!(fx.sink.total(), 0);
}

#[tokio::test]
async fn test_concurrent_subscribes_register_once() {
    // --- Arrange
    let fx = fixture().await;
    let orders = queue("orders");
    let conns: Vec<_> = (0..8).map(|i| connect(&fx.mux, &format!("c{i}"))).collect();

    // --- Act
    let mut tasks = Vec::new();
    for conn in conns.clone() {
        let mux = fx.mux.clone();
        let orders = orders.clone();
        tasks.push(tokio::spawn(async move { mux.subscribe(&conn, &orders).await }));
    }
    for task in tasks {
        task.await.expect("join").expect("subscribe");
    }

    // --- Assert
    assert_eq!(fx.provider.subscribes("orders"), 1);
    assert_eq!(fx.mux.registry().interested_in(&orders).len(), 8);
    assert_eq!(fx.broker.consumer_count(&orders), 1);
}

#[tokio::test]
async fn test_subscribers_keep_receiving_after_connection_loss() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let c2 = connect(&fx.mux, "c2");
    let orders = queue("orders");
    fx.mux.subscribe(&c1, &orders).await.expect("c1");

    // --- Act
    fx.broker.disconnect_all();
    let outcome = fx.mux.subscribe(&c2, &orders).await.expect("c2");
    fx.mux.publish(&orders, QueueMessage::new("after loss")).await.expect("publish");

    // --- Assert
    assert_eq!(outcome, SubscribeOutcome::Subscribed);
    assert!(eventually(2000, || fx.sink.total() == 2).await, "both connections should receive");
    assert_eq!(fx.sink.deliveries_to(&c1).len(), 1);
    assert_eq!(fx.sink.deliveries_to(&c2).len(), 1);
    assert_eq!(fx.broker.consumer_count(&orders), 1);
}

#[tokio::test]
async fn test_slow_queue_does_not_stall_other_queues() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let c2 = connect(&fx.mux, "c2");
    let gate = fx.provider.hold_subscribe("slow");

    let slow = tokio::spawn({
        let mux = fx.mux.clone();
        let c1 = c1.clone();
        async move { mux.subscribe(&c1, &queue("slow")).await }
    });
    assert!(eventually(2000, || fx.provider.parked() == 1).await, "slow subscribe should be in flight");

    // --- Act
    let fast = timeout(Duration::from_secs(1), fx.mux.subscribe(&c2, &queue("fast"))).await;
    let left = timeout(Duration::from_secs(1), fx.mux.unsubscribe(&c2, &queue("fast"))).await;
    let gone = timeout(Duration::from_secs(1), fx.mux.on_disconnect(&c2)).await;

    gate.notify_one();
    let slow = timeout(Duration::from_secs(2), slow)
        .await
        .expect("slow subscribe should finish once released")
        .expect("join")
        .expect("slow subscribe");

    // --- Assert
    assert!(matches!(fast, Ok(Ok(SubscribeOutcome::Subscribed))), "{fast:?}");
    assert!(left.is_ok(), "unsubscribe of another queue must not wait");
    assert!(gone.is_ok(), "disconnect of another connection must not wait");
    assert_eq!(slow, SubscribeOutcome::Subscribed);
    assert_eq!(fx.provider.unsubscribes("fast"), 1);
    assert!(fx.mux.registry().registered_queues().contains(&queue("slow")));
}

#[tokio::test]
async fn test_shutdown_closes_provider() {
    // --- Arrange
    let fx = fixture().await;
    let c1 = connect(&fx.mux, "c1");
    let orders = queue("orders");
    fx.mux.subscribe(&c1, &orders).await.expect("c1");

    // --- Act
    fx.mux.shutdown().await.expect("shutdown");

    // --- Assert
    assert!(fx.mux.registry().registered_queues().is_empty());
    assert_eq!(fx.broker.consumer_count(&orders), 0);
    let err = fx
        .mux
        .publish(&orders, QueueMessage::new("late"))
        .await
        .expect_err("publish after shutdown");
    assert!(matches!(err, QueueError::PublishFailed { .. }));
}

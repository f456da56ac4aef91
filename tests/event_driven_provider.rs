// tests/event_driven_provider.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, queue, Recorder};
use mom_pubsub::{
    // ---
    EventDrivenProvider,
    MemoryBroker,
    QueueError,
    QueueMessage,
    QueueProvider,
};

fn provider_over(broker: &MemoryBroker) -> Arc<EventDrivenProvider> {
    Arc::new(EventDrivenProvider::new("ed-test", Arc::new(broker.clone())))
}

#[tokio::test]
async fn test_delivers_body_headers_and_id() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    let recorder = Recorder::new();
    provider
        .subscribe(&orders, recorder.as_handler())
        .await
        .expect("subscribe");

    // --- Act
    provider
        .publish(&orders, QueueMessage::new("hello").with_attribute("k", "v"))
        .await
        .expect("publish");

    // --- Assert
    assert!(eventually(2000, || broker.stats().acked == 1).await, "message should be acked");
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].body, "hello");
    assert_eq!(seen[0].attributes_or_empty().get("k").map(String::as_str), Some("v"));
    assert!(seen[0].id.as_deref().is_some_and(|id| !id.is_empty()));
    assert_eq!(broker.unacked_count(&orders), 0);
}

#[tokio::test]
async fn test_handler_failure_requeues_exactly_once_per_delivery() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    let recorder = Recorder::failing_first(1);
    provider
        .subscribe(&orders, recorder.as_handler())
        .await
        .expect("subscribe");

    // --- Act
    provider
        .publish(&orders, QueueMessage::new("retry me"))
        .await
        .expect("publish");

    // --- Assert
    assert!(eventually(2000, || broker.stats().acked == 1).await, "redelivery should succeed");

    let stats = broker.stats();
    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.delivered, 2);
    assert_eq!(recorder.calls(), 2);

    let seen = recorder.seen();
    assert_eq!(seen[0].id, seen[1].id, "redelivery keeps the message id");
}

#[tokio::test]
async fn test_resubscribe_replaces_consumer() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    let first = Recorder::new();
    let second = Recorder::new();

    // --- Act
    provider.subscribe(&orders, first.as_handler()).await.expect("first");
    let first_tag = provider.consumer_tag(&orders).await;
    provider.subscribe(&orders, second.as_handler()).await.expect("second");
    let second_tag = provider.consumer_tag(&orders).await;

    provider.publish(&orders, QueueMessage::new("a")).await.expect("publish a");
    provider.publish(&orders, QueueMessage::new("b")).await.expect("publish b");

    // --- Assert
    assert_eq!(broker.consumer_count(&orders), 1);
    assert_ne!(first_tag, second_tag);
    assert!(eventually(2000, || second.calls() == 2).await);
    assert_eq!(first.calls(), 0);
}

#[tokio::test]
async fn test_unsubscribe_stops_consumption() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    let recorder = Recorder::new();
    provider.subscribe(&orders, recorder.as_handler()).await.expect("subscribe");

    // --- Act
    provider.unsubscribe(&orders).await.expect("unsubscribe");
    provider.unsubscribe(&orders).await.expect("second unsubscribe is a no-op");
    provider.publish(&orders, QueueMessage::new("nobody home")).await.expect("publish");

    // --- Assert
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.calls(), 0);
    assert_eq!(broker.consumer_count(&orders), 0);
    assert_eq!(broker.ready_count(&orders), 1);
    assert!(provider.consumer_tag(&orders).await.is_none());
}

#[tokio::test]
async fn test_reconnects_lazily_after_connection_loss() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    provider.connect().await.expect("connect");
    assert_eq!(broker.stats().connections, 1);

    // --- Act
    broker.disconnect_all();
    assert!(!provider.is_connected());
    provider.publish(&orders, QueueMessage::new("after loss")).await.expect("publish");

    // --- Assert
    assert!(provider.is_connected());
    assert_eq!(broker.stats().connections, 2);
    assert_eq!(broker.ready_count(&orders), 1);

    // The declared-queue cache was reset, so a consumer on the new channel works.
    let recorder = Recorder::new();
    provider.subscribe(&orders, recorder.as_handler()).await.expect("subscribe");
    assert!(eventually(2000, || recorder.calls() == 1).await);
}

#[tokio::test]
async fn test_consumers_are_restored_after_connection_loss() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    let recorder = Recorder::new();
    provider.subscribe(&orders, recorder.as_handler()).await.expect("subscribe");
    let tag_before = provider.consumer_tag(&orders).await;

    // --- Act
    broker.disconnect_all();
    assert_eq!(broker.consumer_count(&orders), 0);
    provider.publish(&orders, QueueMessage::new("after loss")).await.expect("publish");

    // --- Assert
    assert!(eventually(2000, || recorder.calls() == 1).await, "restored consumer receives");
    assert_eq!(recorder.seen()[0].body, "after loss");
    assert_eq!(broker.consumer_count(&orders), 1);
    assert_eq!(broker.stats().connections, 2);
    assert!(eventually(2000, || broker.stats().acked == 1).await);

    let tag_after = provider.consumer_tag(&orders).await;
    assert!(tag_after.is_some());
    assert_ne!(tag_before, tag_after);
}

#[tokio::test]
async fn test_unsubscribe_after_connection_loss_is_not_restored() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    let recorder = Recorder::new();
    provider.subscribe(&orders, recorder.as_handler()).await.expect("subscribe");
    broker.disconnect_all();

    // --- Act
    provider.unsubscribe(&orders).await.expect("unsubscribe of a lost consumer");
    provider.publish(&orders, QueueMessage::new("nobody home")).await.expect("publish");

    // --- Assert
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.calls(), 0);
    assert_eq!(broker.consumer_count(&orders), 0);
    assert_eq!(broker.ready_count(&orders), 1);
    assert!(provider.consumer_tag(&orders).await.is_none());
}

#[tokio::test]
async fn test_concurrent_operations_share_one_connect() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");

    // --- Act
    let mut tasks = Vec::new();
    for i in 0..10 {
        let provider = Arc::clone(&provider);
        let orders = orders.clone();
        tasks.push(tokio::spawn(async move {
            provider.publish(&orders, QueueMessage::new(format!("m{i}"))).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("publish");
    }

    // --- Assert
    assert_eq!(broker.stats().connections, 1);
    assert_eq!(broker.ready_count(&orders), 10);
}

#[tokio::test]
async fn test_connect_failure_surfaces_and_recovers() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    broker.refuse_connections(true);

    // --- Act
    let err = provider
        .publish(&orders, QueueMessage::new("x"))
        .await
        .expect_err("broker refuses connections");

    broker.refuse_connections(false);
    let retry = provider.publish(&orders, QueueMessage::new("x")).await;

    // --- Assert
    assert!(matches!(err, QueueError::PublishFailed { .. }));
    assert_eq!(err.queue_name(), Some("orders"));
    assert!(retry.is_ok(), "next operation reconnects: {retry:?}");
}

#[tokio::test]
async fn test_close_cancels_consumers_and_rejects_later_calls() {
    // --- Arrange
    let broker = MemoryBroker::new();
    let provider = provider_over(&broker);
    let orders = queue("orders");
    let billing = queue("billing");
    provider.subscribe(&orders, Recorder::new().as_handler()).await.expect("orders");
    provider.subscribe(&billing, Recorder::new().as_handler()).await.expect("billing");

    // --- Act
    provider.close().await.expect("close");

    // --- Assert
    assert_eq!(broker.consumer_count(&orders), 0);
    assert_eq!(broker.consumer_count(&billing), 0);
    assert!(!provider.is_connected());

    let publish = provider.publish(&orders, QueueMessage::new("late")).await;
    assert!(matches!(publish, Err(QueueError::PublishFailed { .. })));

    let subscribe = provider.subscribe(&orders, Recorder::new().as_handler()).await;
    assert!(matches!(subscribe, Err(QueueError::SubscribeFailed { .. })));

    provider.close().await.expect("second close is harmless");
}

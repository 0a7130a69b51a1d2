//! End-to-end publish/subscribe over the in-memory broker.
//!
//! ```text
//!  publisher ──▶ "events" topic exchange ──▶ bound queue ──▶ subscriber
//!                                                               │
//!                                                 registry fan-out + ack/nack
//!                                                               │
//!                                                     "dead-letters" on reject
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use topic_bus::broker::{InMemoryBroker, MessageProperties, QueueOptions};
use topic_bus::{
    ConnectionConfig, ConnectionManager, Envelope, EventHandler, EventPublisher, EventSubscriber,
    HandlerError, HandlerRegistry, QueueConfig,
};

const EXCHANGE: &str = "events";
const DLQ: &str = "dead-letters";

struct Counting {
    calls: AtomicUsize,
}

impl Counting {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for Counting {
    async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
        Err("inventory unavailable".into())
    }
}

fn connection(broker: &InMemoryBroker) -> ConnectionManager {
    ConnectionManager::new(Arc::new(broker.clone()), ConnectionConfig::default())
}

fn dead_lettered_config() -> QueueConfig {
    QueueConfig {
        dead_letter_queue: Some(DLQ.to_string()),
        ..QueueConfig::default()
    }
}

/// Poll until `condition` holds, failing the test after one second.
async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 1s");
}

#[tokio::test]
async fn published_event_reaches_matching_handlers_only() {
    let broker = InMemoryBroker::new();

    let registry = Arc::new(HandlerRegistry::new());
    let by_domain = Counting::new();
    let by_action = Counting::new();
    let other_domain = Counting::new();
    registry.subscribe("order.*", by_domain.clone() as Arc<dyn EventHandler>);
    registry.subscribe("*.created", by_action.clone() as Arc<dyn EventHandler>);
    registry.subscribe("user.*", other_domain.clone() as Arc<dyn EventHandler>);

    let mut subscriber =
        EventSubscriber::new(connection(&broker), "order-service", EXCHANGE, registry);
    subscriber.connect().await.unwrap();
    subscriber.setup_queue("#").await.unwrap();
    let stop = subscriber.stop_handle();

    let mut publisher = EventPublisher::new(connection(&broker), EXCHANGE);
    publisher.connect().await.unwrap();
    let event = Envelope::new("order", "created").with_entry("id", json!("o-1"));
    publisher.publish(&event).await.unwrap();

    let consumer = tokio::spawn(async move { subscriber.start_consuming().await });

    eventually(|| by_domain.calls() == 1 && by_action.calls() == 1).await;
    assert_eq!(other_domain.calls(), 0);

    stop.stop();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_handler_dead_letters_the_message() {
    let broker = InMemoryBroker::new();

    // The dead-letter queue must exist for rejected messages to land there.
    let mut admin = connection(&broker);
    admin.connect().await.unwrap();
    admin
        .declare_queue(DLQ, QueueOptions::default())
        .await
        .unwrap();

    let registry = Arc::new(HandlerRegistry::new());
    let sibling = Counting::new();
    registry.subscribe("order.*", Arc::new(Failing));
    registry.subscribe("order.*", sibling.clone() as Arc<dyn EventHandler>);

    let mut subscriber = EventSubscriber::with_config(
        connection(&broker),
        "order-service",
        EXCHANGE,
        registry,
        dead_lettered_config(),
    );
    subscriber.connect().await.unwrap();
    subscriber.setup_queue("order.*").await.unwrap();
    let stop = subscriber.stop_handle();

    let mut publisher = EventPublisher::new(connection(&broker), EXCHANGE);
    publisher.connect().await.unwrap();
    publisher
        .publish(&Envelope::new("order", "created"))
        .await
        .unwrap();

    let consumer = tokio::spawn(async move { subscriber.start_consuming().await });

    // The failing handler forces a reject, but its sibling still ran.
    eventually(|| broker.queue_depth(DLQ) == Some(1)).await;
    assert_eq!(sibling.calls(), 1);
    // Not requeued: the work queue drained.
    assert_eq!(broker.queue_depth("order-service"), Some(0));

    stop.stop();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered_without_invoking_handlers() {
    let broker = InMemoryBroker::new();

    let mut admin = connection(&broker);
    admin.connect().await.unwrap();
    admin
        .declare_queue(DLQ, QueueOptions::default())
        .await
        .unwrap();

    let registry = Arc::new(HandlerRegistry::new());
    let handler = Counting::new();
    registry.subscribe("#", handler.clone() as Arc<dyn EventHandler>);

    let mut subscriber = EventSubscriber::with_config(
        connection(&broker),
        "order-service",
        EXCHANGE,
        registry,
        dead_lettered_config(),
    );
    subscriber.connect().await.unwrap();
    subscriber.setup_queue("#").await.unwrap();
    let stop = subscriber.stop_handle();

    // Raw bytes that are not an envelope, published straight to the exchange.
    admin
        .publish(
            EXCHANGE,
            "order.created",
            b"not an envelope".to_vec(),
            MessageProperties::default(),
        )
        .await
        .unwrap();

    let consumer = tokio::spawn(async move { subscriber.start_consuming().await });

    eventually(|| broker.queue_depth(DLQ) == Some(1)).await;
    assert_eq!(handler.calls(), 0);

    stop.stop();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_handle_ends_the_consume_loop() {
    let broker = InMemoryBroker::new();

    let registry = Arc::new(HandlerRegistry::new());
    let handler = Counting::new();
    registry.subscribe("#", handler.clone() as Arc<dyn EventHandler>);

    let mut subscriber =
        EventSubscriber::new(connection(&broker), "order-service", EXCHANGE, registry);
    subscriber.connect().await.unwrap();
    subscriber.setup_queue("#").await.unwrap();
    let stop = subscriber.stop_handle();

    let mut publisher = EventPublisher::new(connection(&broker), EXCHANGE);
    publisher.connect().await.unwrap();
    publisher
        .publish(&Envelope::new("order", "created"))
        .await
        .unwrap();

    let consumer = tokio::spawn(async move { subscriber.start_consuming().await });

    // The in-flight message is settled before the loop exits.
    eventually(|| handler.calls() == 1).await;
    stop.stop();
    consumer.await.unwrap().unwrap();

    // Events published after the stop are not consumed.
    publisher
        .publish(&Envelope::new("order", "updated"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls(), 1);
}

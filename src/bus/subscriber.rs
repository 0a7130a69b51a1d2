//! Event subscriber — consume loop with acknowledgment discipline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, ConsumeOptions, Delivery, ExchangeKind, QueueOptions};
use crate::connection::ConnectionManager;
use crate::envelope::Envelope;
use crate::registry::HandlerRegistry;

/// Queue and consumer settings for a subscriber.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Whether the queue survives broker restart.
    pub durable: bool,
    /// Whether the queue belongs to this subscriber's session alone.
    pub exclusive: bool,
    /// Whether the queue is deleted when the subscriber goes away.
    pub auto_delete: bool,
    /// Maximum unacknowledged messages delivered concurrently.
    pub prefetch: usize,
    /// Destination for messages rejected without requeue.
    pub dead_letter_queue: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            prefetch: 1,
            dead_letter_queue: None,
        }
    }
}

/// Handle for stopping a running consume loop from another task.
///
/// The loop finishes the message it is processing — including its
/// acknowledge/reject decision — before exiting.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub(crate) fn from_sender(tx: Arc<watch::Sender<bool>>) -> Self {
        Self { tx }
    }

    /// Request the consume loop to stop.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Consumes envelopes from a queue and dispatches them through a
/// [`HandlerRegistry`].
///
/// Acknowledgment policy: a message whose handlers all succeed is
/// acknowledged; a message with any failing handler is rejected without
/// requeue — a deterministically failing handler must not cause an
/// unbounded redelivery loop, so retry is delegated to the queue's
/// dead-letter mechanism. A payload that fails to deserialize can never
/// succeed on retry and is likewise rejected without requeue, with no
/// handler invoked. Every delivery receives exactly one terminal
/// disposition.
///
/// ## Example
///
/// ```ignore
/// let mut subscriber =
///     EventSubscriber::new(connection, "order-service", "events", registry);
/// subscriber.connect().await?;
/// subscriber.setup_queue("order.*").await?;
///
/// let stop = subscriber.stop_handle();
/// let consumer = tokio::spawn(async move { subscriber.start_consuming().await });
/// // ... later:
/// stop.stop();
/// consumer.await??;
/// ```
pub struct EventSubscriber {
    connection: ConnectionManager,
    queue: String,
    exchange: String,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl EventSubscriber {
    /// Create a subscriber with default [`QueueConfig`].
    pub fn new(
        connection: ConnectionManager,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self::with_config(connection, queue, exchange, registry, QueueConfig::default())
    }

    /// Create a subscriber with explicit queue settings.
    pub fn with_config(
        connection: ConnectionManager,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        config: QueueConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let queue = queue.into();
        info!(queue = %queue, "EventSubscriber created");
        Self {
            connection,
            queue,
            exchange: exchange.into(),
            registry,
            config,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// Connect the underlying session.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.connection.connect().await
    }

    /// A handle that stops [`start_consuming`](Self::start_consuming) from
    /// another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Declare the exchange and queue and bind them under a routing
    /// pattern. Idempotent; call once per binding pattern to subscribe the
    /// queue to several patterns.
    pub async fn setup_queue(&mut self, pattern: &str) -> Result<(), BrokerError> {
        self.connection
            .declare_exchange(&self.exchange, ExchangeKind::Topic, true)
            .await?;
        let options = QueueOptions {
            durable: self.config.durable,
            exclusive: self.config.exclusive,
            auto_delete: self.config.auto_delete,
            dead_letter_queue: self.config.dead_letter_queue.clone(),
        };
        self.connection.declare_queue(&self.queue, options).await?;
        self.connection
            .bind_queue(&self.queue, &self.exchange, pattern)
            .await?;
        info!(queue = %self.queue, exchange = %self.exchange, pattern, "Queue bound");
        Ok(())
    }

    /// Consume until stopped or the session ends.
    ///
    /// Blocks its task. Between messages the stop signal is checked; an
    /// in-flight message is always settled before the loop exits.
    pub async fn start_consuming(&mut self) -> Result<(), BrokerError> {
        let options = ConsumeOptions {
            prefetch: self.config.prefetch,
            auto_ack: false,
        };
        let mut deliveries = self.connection.consume(&self.queue, options).await?;
        let mut stop = self.stop_rx.clone();
        info!(queue = %self.queue, prefetch = self.config.prefetch, "Consumer started");

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.process(delivery).await?,
                    None => break,
                },
            }
        }

        info!(queue = %self.queue, "Consumer stopped");
        Ok(())
    }

    /// Settle one delivery: deserialize, dispatch, acknowledge or reject.
    async fn process(&mut self, delivery: Delivery) -> Result<(), BrokerError> {
        let tag = delivery.delivery_tag;

        let envelope = match Envelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Rejecting malformed message without requeue"
                );
                return self.connection.nack(tag, false).await;
            }
        };

        debug!(
            event_id = %envelope.event_id,
            routing_key = %envelope.routing_key(),
            "Dispatching event"
        );
        let result = self.registry.invoke_all(&envelope).await;

        if result.all_succeeded() {
            debug!(event_id = %envelope.event_id, "Acknowledging message");
            self.connection.ack(tag).await
        } else {
            warn!(
                event_id = %envelope.event_id,
                failed = result.failed(),
                succeeded = result.succeeded,
                "Rejecting message without requeue after handler failure"
            );
            self.connection.nack(tag, false).await
        }
    }

    /// Close the underlying session.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.connection.close().await
    }
}

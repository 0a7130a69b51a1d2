//! Session traits and wire-level types shared by broker implementations.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes on dot-segmented patterns (`*`, `#`).
    Topic,
    /// Routes on exact routing-key equality.
    Direct,
    /// Routes to every bound queue.
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
        }
    }
}

/// Queue declaration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Whether the queue survives broker restart.
    pub durable: bool,
    /// Whether the queue belongs to a single session.
    pub exclusive: bool,
    /// Whether the queue is deleted when its consumer goes away.
    pub auto_delete: bool,
    /// Queue that receives messages rejected without requeue.
    pub dead_letter_queue: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_queue: None,
        }
    }
}

/// Consumer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries in flight. `0` means unlimited.
    pub prefetch: usize,
    /// Deliveries are considered settled on send; `ack`/`nack` not required.
    pub auto_ack: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            auto_ack: false,
        }
    }
}

/// Per-message transport properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME type of the payload.
    pub content_type: Option<String>,
    /// Correlates a response with its request.
    pub correlation_id: Option<String>,
    /// Queue the receiver should address replies to.
    pub reply_to: Option<String>,
    /// Whether the broker should persist the message.
    pub persistent: bool,
}

/// One message handed to a consumer. Must be settled with exactly one
/// `ack` or `nack` unless consumed with `auto_ack`.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Session-scoped tag used to settle this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Message body.
    pub payload: Vec<u8>,
    /// Transport properties.
    pub properties: MessageProperties,
}

/// Stream of deliveries for one consumer.
#[derive(Debug)]
pub struct DeliveryStream {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    /// Wrap a delivery channel. Broker implementations construct this in
    /// their `consume`.
    pub fn new(receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Receive the next delivery. `None` means the consumer was cancelled
    /// or the session closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// One broker session: a single logical channel carrying declarations,
/// publishes and consumption.
///
/// All operations take `&mut self` — a session belongs to exactly one
/// execution context at a time. `Sync` is required so the futures of the
/// consume loops that hold a session stay spawnable; it grants no shared
/// mutation, since the trait exposes none.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare an exchange. Idempotent for identical parameters; fails
    /// with [`BrokerError::DeclarationConflict`] for differing ones.
    async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Declare a queue, returning its actual name. An empty `name` asks
    /// the broker to generate one (used for exclusive reply queues).
    async fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError>;

    /// Bind a queue to an exchange under a routing pattern. Idempotent.
    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError>;

    /// Publish one message. Fire-and-forget: no delivery confirmation is
    /// awaited. The empty exchange name routes directly to the queue named
    /// by `routing_key`.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Begin consuming from a queue.
    async fn consume(
        &mut self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Acknowledge a delivery.
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery. With `requeue` the message returns to its queue;
    /// without, it goes to the queue's dead-letter queue if one is
    /// configured, otherwise it is dropped.
    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the session. Unacknowledged deliveries return to their
    /// queues. Safe to call more than once.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Opens sessions against one broker. Shared across connection managers;
/// the sessions it produces are not.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a new session.
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

/// Error type for broker and connection operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connecting failed after the configured number of attempts.
    ConnectionFailed { attempts: u32, reason: String },
    /// An operation was attempted before `connect()`.
    NotConnected,
    /// A declaration repeated with conflicting parameters.
    DeclarationConflict { name: String, reason: String },
    /// The named exchange or queue does not exist.
    NotDeclared(String),
    /// The session or connection is closed.
    Closed,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ConnectionFailed { attempts, reason } => {
                write!(f, "connection failed after {} attempt(s): {}", attempts, reason)
            }
            BrokerError::NotConnected => {
                write!(f, "not connected; call connect() first")
            }
            BrokerError::DeclarationConflict { name, reason } => {
                write!(f, "declaration conflict for '{}': {}", name, reason)
            }
            BrokerError::NotDeclared(name) => {
                write!(f, "'{}' has not been declared", name)
            }
            BrokerError::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for BrokerError {}

//! Event publisher — serialize, derive routing key, publish.

use std::fmt;

use tracing::{debug, info};

use crate::broker::{BrokerError, MessageProperties};
use crate::connection::ConnectionManager;
use crate::envelope::{Envelope, EnvelopeError};

/// Error type for publish operations.
#[derive(Debug)]
pub enum PublishError {
    /// The broker refused or the connection is unusable.
    Broker(BrokerError),
    /// Serialization of the envelope failed.
    Envelope(EnvelopeError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Broker(e) => write!(f, "publish failed: {}", e),
            PublishError::Envelope(e) => write!(f, "publish failed: {}", e),
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublishError::Broker(e) => Some(e),
            PublishError::Envelope(e) => Some(e),
        }
    }
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        PublishError::Broker(err)
    }
}

impl From<EnvelopeError> for PublishError {
    fn from(err: EnvelopeError) -> Self {
        PublishError::Envelope(err)
    }
}

/// Publishes envelopes to a topic exchange.
///
/// Owns its [`ConnectionManager`] — the publishing path never shares a
/// session with a consuming path. The target exchange must already be
/// declared; the broker's rejection surfaces as
/// [`PublishError::Broker`]`(`[`BrokerError::NotDeclared`]`)`.
///
/// ## Example
///
/// ```ignore
/// let mut publisher = EventPublisher::new(connection, "events");
/// publisher.connect().await?;
/// publisher.publish(&Envelope::new("order", "created")).await?;
/// ```
pub struct EventPublisher {
    connection: ConnectionManager,
    exchange: String,
}

impl EventPublisher {
    /// Create a publisher targeting an exchange.
    pub fn new(connection: ConnectionManager, exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        info!(exchange = %exchange, "EventPublisher created");
        Self {
            connection,
            exchange,
        }
    }

    /// Connect the underlying session.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.connection.connect().await
    }

    /// Publish one envelope.
    ///
    /// Serializes the envelope, derives its routing key, and publishes a
    /// persistent JSON message. Failures surface synchronously; nothing is
    /// silently dropped. No retry beyond what the connection performed at
    /// connect time.
    pub async fn publish(&mut self, envelope: &Envelope) -> Result<(), PublishError> {
        let payload = envelope.to_bytes()?;
        let routing_key = envelope.routing_key();
        let properties = MessageProperties {
            content_type: Some("application/json".to_string()),
            persistent: true,
            ..MessageProperties::default()
        };

        debug!(
            event_id = %envelope.event_id,
            exchange = %self.exchange,
            %routing_key,
            "Publishing event"
        );
        self.connection
            .publish(&self.exchange, &routing_key, payload, properties)
            .await?;
        info!(event_id = %envelope.event_id, %routing_key, "Event published");
        Ok(())
    }

    /// Close the underlying session.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.connection.close().await
    }
}

//! Connection manager — owns one broker session for one execution context.
//!
//! A [`ConnectionManager`] wraps a single [`BrokerSession`] and adds
//! bounded-retry connection establishment. It is deliberately not `Clone`
//! and every broker operation takes `&mut self`: one instance belongs to
//! exactly one logical execution context. A service that both publishes
//! and consumes uses two managers, never one shared between roles.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use topic_bus::broker::{ExchangeKind, InMemoryBroker};
//! use topic_bus::{ConnectionConfig, ConnectionManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = InMemoryBroker::new();
//! let mut connection = ConnectionManager::new(Arc::new(broker), ConnectionConfig::default());
//!
//! connection.connect().await.unwrap();
//! connection.declare_exchange("events", ExchangeKind::Topic, true).await.unwrap();
//! connection.close().await.unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::{
    BrokerError, BrokerSession, BrokerTransport, ConsumeOptions, DeliveryStream, ExchangeKind,
    MessageProperties, QueueOptions,
};

/// Connection establishment settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How many times `connect()` tries before surfacing failure.
    pub connection_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Owns one broker session and exposes declare/bind/publish/consume
/// primitives on it.
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    config: ConnectionConfig,
    session: Option<Box<dyn BrokerSession>>,
}

impl ConnectionManager {
    /// Create a manager over a transport. No session is opened until
    /// [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            session: None,
        }
    }

    /// Establish the session, retrying up to the configured attempt count
    /// with the configured delay between attempts. Idempotent when already
    /// connected.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.session.is_some() {
            debug!("Already connected");
            return Ok(());
        }

        let attempts = self.config.connection_attempts.max(1);
        let mut last_reason = String::new();
        for attempt in 1..=attempts {
            info!(attempt, attempts, "Connecting to broker");
            match self.transport.open_session().await {
                Ok(session) => {
                    info!("Connected to broker");
                    self.session = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Connection attempt failed");
                    last_reason = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(BrokerError::ConnectionFailed {
            attempts,
            reason: last_reason,
        })
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn session(&mut self) -> Result<&mut Box<dyn BrokerSession>, BrokerError> {
        self.session.as_mut().ok_or(BrokerError::NotConnected)
    }

    /// Declare an exchange. Idempotent for identical parameters.
    pub async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.session()?.declare_exchange(name, kind, durable).await
    }

    /// Declare a queue, returning its actual name.
    pub async fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        self.session()?.declare_queue(name, options).await
    }

    /// Bind a queue to an exchange under a routing pattern.
    pub async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.session()?.bind_queue(queue, exchange, pattern).await
    }

    /// Publish one message. Fire-and-forget with respect to delivery
    /// confirmation.
    pub async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.session()?
            .publish(exchange, routing_key, payload, properties)
            .await
    }

    /// Begin consuming from a queue.
    pub async fn consume(
        &mut self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.session()?.consume(queue, options).await
    }

    /// Acknowledge a delivery.
    pub async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.session()?.ack(delivery_tag).await
    }

    /// Reject a delivery.
    pub async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.session()?.nack(delivery_tag, requeue).await
    }

    /// Release the session. Safe to call multiple times.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        match self.session.as_mut() {
            Some(session) => {
                session.close().await?;
                self.session = None;
                info!("Connection closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

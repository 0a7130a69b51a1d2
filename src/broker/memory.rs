//! In-process topic-exchange broker.
//!
//! Implements the full [`BrokerSession`] contract against shared in-memory
//! state: topic/direct/fanout exchanges, queue bindings, prefetch-bounded
//! delivery, ack/nack settlement and dead-letter routing. Useful for:
//! - unit and integration testing without external dependencies
//! - single-process applications
//! - development and prototyping
//!
//! ## Example
//!
//! ```
//! use topic_bus::broker::{
//!     BrokerSession, BrokerTransport, ConsumeOptions, ExchangeKind, InMemoryBroker,
//!     MessageProperties, QueueOptions,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = InMemoryBroker::new();
//! let mut session = broker.open_session().await.unwrap();
//!
//! session.declare_exchange("events", ExchangeKind::Topic, true).await.unwrap();
//! session.declare_queue("orders", QueueOptions::default()).await.unwrap();
//! session.bind_queue("orders", "events", "order.*").await.unwrap();
//!
//! session
//!     .publish("events", "order.created", b"{}".to_vec(), MessageProperties::default())
//!     .await
//!     .unwrap();
//!
//! let mut stream = session.consume("orders", ConsumeOptions::default()).await.unwrap();
//! let delivery = stream.recv().await.unwrap();
//! assert_eq!(delivery.routing_key, "order.created");
//! session.ack(delivery.delivery_tag).await.unwrap();
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::session::{
    BrokerError, BrokerSession, BrokerTransport, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, MessageProperties, QueueOptions,
};
use crate::pattern::Pattern;

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
}

struct Binding {
    queue: String,
    pattern: Pattern,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

struct Consumer {
    tx: mpsc::UnboundedSender<Delivery>,
    prefetch: usize,
    auto_ack: bool,
    unacked: usize,
    session: u64,
}

struct Queue {
    options: QueueOptions,
    exclusive_owner: Option<u64>,
    ready: VecDeque<Message>,
    consumer: Option<Consumer>,
}

struct Unacked {
    queue: String,
    message: Message,
    session: u64,
}

#[derive(Default)]
struct Core {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_session: u64,
}

impl Core {
    fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        match self.exchanges.get(name) {
            Some(existing) => {
                if existing.kind != kind || existing.durable != durable {
                    return Err(BrokerError::DeclarationConflict {
                        name: name.to_string(),
                        reason: format!(
                            "exchange exists as {} (durable: {})",
                            existing.kind, existing.durable
                        ),
                    });
                }
                Ok(())
            }
            None => {
                debug!(exchange = name, %kind, durable, "Declared exchange");
                self.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
        session: u64,
    ) -> Result<String, BrokerError> {
        let name = if name.is_empty() {
            format!("gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        match self.queues.get(&name) {
            Some(existing) => {
                if let Some(owner) = existing.exclusive_owner {
                    if owner != session {
                        return Err(BrokerError::DeclarationConflict {
                            name,
                            reason: "queue is exclusive to another session".to_string(),
                        });
                    }
                }
                if existing.options != options {
                    return Err(BrokerError::DeclarationConflict {
                        name,
                        reason: "queue exists with different options".to_string(),
                    });
                }
                Ok(name)
            }
            None => {
                debug!(queue = %name, ?options, "Declared queue");
                let exclusive_owner = options.exclusive.then_some(session);
                self.queues.insert(
                    name.clone(),
                    Queue {
                        options,
                        exclusive_owner,
                        ready: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(name)
            }
        }
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::NotDeclared(queue.to_string()));
        }
        let Some(ex) = self.exchanges.get_mut(exchange) else {
            return Err(BrokerError::NotDeclared(exchange.to_string()));
        };

        let already_bound = ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern.as_str() == pattern);
        if !already_bound {
            debug!(queue, exchange, pattern, "Bound queue");
            ex.bindings.push(Binding {
                queue: queue.to_string(),
                pattern: Pattern::new(pattern),
            });
        }
        Ok(())
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange, routing_key, "Unroutable message dropped");
            return Ok(());
        }

        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            properties,
        };
        for queue_name in targets {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.ready.push_back(message.clone());
                self.pump(&queue_name);
            }
        }
        Ok(())
    }

    /// Resolve the set of queues a publish reaches.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        // The default exchange routes directly to the queue named by the key.
        if exchange.is_empty() {
            if !self.queues.contains_key(routing_key) {
                return Err(BrokerError::NotDeclared(routing_key.to_string()));
            }
            return Ok(vec![routing_key.to_string()]);
        }

        let Some(ex) = self.exchanges.get(exchange) else {
            return Err(BrokerError::NotDeclared(exchange.to_string()));
        };

        let mut targets: Vec<String> = Vec::new();
        for binding in &ex.bindings {
            let matched = match ex.kind {
                ExchangeKind::Topic => binding.pattern.matches(routing_key),
                ExchangeKind::Direct => binding.pattern.as_str() == routing_key,
                ExchangeKind::Fanout => true,
            };
            // One copy per queue even when several bindings match.
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn consume(
        &mut self,
        queue_name: &str,
        options: ConsumeOptions,
        session: u64,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Err(BrokerError::NotDeclared(queue_name.to_string()));
        };
        if let Some(owner) = queue.exclusive_owner {
            if owner != session {
                return Err(BrokerError::DeclarationConflict {
                    name: queue_name.to_string(),
                    reason: "queue is exclusive to another session".to_string(),
                });
            }
        }
        // A consumer whose stream was dropped no longer counts.
        if let Some(existing) = &queue.consumer {
            if !existing.tx.is_closed() {
                return Err(BrokerError::DeclarationConflict {
                    name: queue_name.to_string(),
                    reason: "queue already has an active consumer".to_string(),
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumer = Some(Consumer {
            tx,
            prefetch: options.prefetch,
            auto_ack: options.auto_ack,
            unacked: 0,
            session,
        });
        debug!(queue = queue_name, ?options, "Consumer attached");
        self.pump(queue_name);
        Ok(rx)
    }

    /// Deliver ready messages to the queue's consumer while it has
    /// prefetch capacity.
    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let Some(consumer) = queue.consumer.as_mut() else {
                return;
            };
            let capacity =
                consumer.auto_ack || consumer.prefetch == 0 || consumer.unacked < consumer.prefetch;
            if !capacity || queue.ready.is_empty() {
                return;
            }
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                properties: message.properties.clone(),
            };
            let auto_ack = consumer.auto_ack;
            let session = consumer.session;

            match consumer.tx.send(delivery) {
                Ok(()) => {
                    if !auto_ack {
                        consumer.unacked += 1;
                        self.unacked.insert(
                            tag,
                            Unacked {
                                queue: queue_name.to_string(),
                                message,
                                session,
                            },
                        );
                    }
                }
                Err(_) => {
                    // Consumer stream dropped: detach it and keep the message.
                    queue.ready.push_front(message);
                    queue.consumer = None;
                    return;
                }
            }
        }
    }

    fn ack(&mut self, tag: u64) {
        let Some(unacked) = self.unacked.remove(&tag) else {
            warn!(delivery_tag = tag, "Ack for unknown delivery tag");
            return;
        };
        self.release_slot(&unacked);
        self.pump(&unacked.queue);
    }

    fn nack(&mut self, tag: u64, requeue: bool) {
        let Some(unacked) = self.unacked.remove(&tag) else {
            warn!(delivery_tag = tag, "Nack for unknown delivery tag");
            return;
        };
        self.release_slot(&unacked);

        if requeue {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(unacked.message);
            }
            self.pump(&unacked.queue);
            return;
        }

        let dead_letter = self
            .queues
            .get(&unacked.queue)
            .and_then(|q| q.options.dead_letter_queue.clone());
        match dead_letter {
            Some(dlq) if self.queues.contains_key(&dlq) => {
                debug!(queue = %unacked.queue, dlq = %dlq, "Dead-lettering rejected message");
                if let Some(queue) = self.queues.get_mut(&dlq) {
                    queue.ready.push_back(unacked.message);
                }
                self.pump(&dlq);
            }
            Some(dlq) => {
                warn!(queue = %unacked.queue, dlq = %dlq, "Dead-letter queue not declared; message dropped");
            }
            None => {
                debug!(queue = %unacked.queue, "Rejected message dropped (no dead-letter queue)");
            }
        }
        self.pump(&unacked.queue);
    }

    fn release_slot(&mut self, unacked: &Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = queue.consumer.as_mut() {
                if consumer.session == unacked.session {
                    consumer.unacked = consumer.unacked.saturating_sub(1);
                }
            }
        }
    }

    fn close_session(&mut self, session: u64) {
        // Return this session's unacknowledged deliveries to their queues.
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(unacked.message);
                }
            }
        }

        // Detach consumers; drop auto-delete and exclusive queues.
        let mut removed: Vec<String> = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let owned_consumer = queue
                .consumer
                .as_ref()
                .is_some_and(|c| c.session == session);
            if owned_consumer {
                queue.consumer = None;
            }
            let exclusive_here = queue.exclusive_owner == Some(session);
            if exclusive_here || (owned_consumer && queue.options.auto_delete) {
                removed.push(name.clone());
            }
        }
        for name in removed {
            debug!(queue = %name, "Removing queue on session close");
            self.queues.remove(&name);
            for ex in self.exchanges.values_mut() {
                ex.bindings.retain(|b| b.queue != name);
            }
        }
    }
}

/// Shared in-memory broker. Cloning yields another handle to the same
/// broker state; open one session per execution context.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    core: Arc<Mutex<Core>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting in a queue (excluding unacknowledged
    /// deliveries). `None` when the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        core.queues.get(queue).map(|q| q.ready.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let id = {
            let mut core = self.lock();
            core.next_session += 1;
            core.next_session
        };
        Ok(Box::new(InMemorySession {
            core: Arc::clone(&self.core),
            id,
            closed: false,
        }))
    }
}

/// One session against an [`InMemoryBroker`].
struct InMemorySession {
    core: Arc<Mutex<Core>>,
    id: u64,
    closed: bool,
}

impl InMemorySession {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Core>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        Ok(self.core.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.lock()?.declare_exchange(name, kind, durable)
    }

    async fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let id = self.id;
        self.lock()?.declare_queue(name, options, id)
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.lock()?.bind_queue(queue, exchange, pattern)
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.lock()?.publish(exchange, routing_key, payload, properties)
    }

    async fn consume(
        &mut self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let id = self.id;
        let receiver = self.lock()?.consume(queue, options, id)?;
        Ok(DeliveryStream::new(receiver))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.lock()?.ack(delivery_tag);
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.lock()?.nack(delivery_tag, requeue);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        core.close_session(self.id);
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if !self.closed {
            let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
            core.close_session(self.id);
        }
    }
}

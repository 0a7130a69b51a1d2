//! Broker abstraction — session primitives and an in-process topic exchange.
//!
//! The messaging core never talks to a broker directly; it goes through
//! [`BrokerTransport`] (opens sessions) and [`BrokerSession`] (declare /
//! bind / publish / consume / ack / nack on one logical channel).
//!
//! ```text
//! ┌──────────────────┐   open_session()   ┌──────────────────┐
//! │ BrokerTransport  │ ─────────────────▶ │  BrokerSession   │
//! │ (shared handle)  │                    │ (one per context)│
//! └──────────────────┘                    └──────────────────┘
//!          │                                       │
//!          ▼                                       ▼
//! ┌─────────────────┐    ┌─────────────┐    ┌─────────────────────┐
//! │ InMemoryBroker  │    │ AMQP broker │    │ other topic brokers │
//! │   (included)    │    │ (external)  │    │     (external)      │
//! └─────────────────┘    └─────────────┘    └─────────────────────┘
//! ```
//!
//! [`InMemoryBroker`] is a complete topic exchange for tests,
//! single-process applications, development and prototyping — the same
//! role an in-memory queue plays in any bus stack.

mod memory;
mod session;

pub use memory::InMemoryBroker;
pub use session::{
    BrokerError, BrokerSession, BrokerTransport, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, MessageProperties, QueueOptions,
};

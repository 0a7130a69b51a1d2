//! Publish/consume roles over a topic exchange.
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────────┐  deliver  ┌──────────────────┐
//! │EventPublisher│ ─────────▶ │  topic exchange  │ ────────▶ │ EventSubscriber  │
//! │ (own conn)   │            │ routing_key match│           │ (own conn, queue)│
//! └──────────────┘            └──────────────────┘           └──────────────────┘
//!                                                                     │
//!                                                           invoke_all(envelope)
//!                                                                     ▼
//!                                                            ┌────────────────┐
//!                                                            │HandlerRegistry │
//!                                                            └────────────────┘
//!                                                                     │
//!                                        all succeeded → ack; any failed → nack
//! ```
//!
//! Each role owns its [`ConnectionManager`](crate::ConnectionManager):
//! publishing and consuming for the same service run on two connections,
//! never one shared instance.

mod publisher;
mod subscriber;

pub use publisher::{EventPublisher, PublishError};
pub use subscriber::{EventSubscriber, QueueConfig, StopHandle};

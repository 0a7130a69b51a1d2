//! Topic-routed messaging kernel: typed event envelopes, pattern-matched
//! handler dispatch, publish/consume with acknowledgment discipline, and
//! request/response calls layered on top.
//!
//! ```text
//! publisher ──▶ topic exchange ──▶ bound queues ──▶ subscriber
//!                                                      │
//!                                      HandlerRegistry fan-out
//!                                                      │
//!                                          ack / reject decision
//! ```
//!
//! Messages are routed by dot-segmented keys (`"order.created"`) against
//! binding patterns where `*` matches one segment and `#` matches any
//! number. All traffic is plain JSON, so services written in other
//! languages interoperate on the same exchanges.

pub mod broker;
pub mod bus;
pub mod connection;
pub mod envelope;
pub mod pattern;
pub mod registry;
pub mod rpc;

pub use bus::{EventPublisher, EventSubscriber, PublishError, QueueConfig, StopHandle};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use envelope::{Envelope, EnvelopeError, ENVELOPE_VERSION};
pub use pattern::{Pattern, MATCH_ALL};
pub use registry::{
    EventHandler, HandlerError, HandlerFailure, HandlerRegistry, InvocationResult,
};
pub use rpc::{
    MethodError, RpcClient, RpcError, RpcMethod, RpcRequest, RpcResponse, RpcServer,
    DEFAULT_RPC_TIMEOUT,
};

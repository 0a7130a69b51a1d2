//! Request/response calls layered on publish/consume.
//!
//! ```text
//! ┌───────────┐ request (reply_to, correlation_id) ┌───────────┐
//! │ RpcClient │ ─────────────▶ request queue ────▶ │ RpcServer │
//! │ (own conn)│                                    │ (own conn)│
//! └───────────┘                                    └───────────┘
//!       ▲                                                │
//!       │          response (correlation_id)             │ method dispatch
//!       └───── exclusive reply queue ◀───────────────────┘
//! ```
//!
//! The server consumes [`RpcRequest`]s from a named queue, dispatches to a
//! registered [`RpcMethod`], and publishes exactly one correlated
//! [`RpcResponse`] per request — an unknown method or an overrunning method
//! produces an error response, never silence. The client publishes a
//! request and waits on its own exclusive reply queue, bounded by a
//! client-local timeout; responses are matched by `request_id` alone, so
//! a late response for an abandoned call is simply discarded.

mod client;
mod error;
mod message;
mod server;

pub use client::RpcClient;
pub use error::RpcError;
pub use message::{RpcErrorBody, RpcErrorCode, RpcRequest, RpcResponse, DEFAULT_RPC_TIMEOUT};
pub use server::{MethodError, RpcMethod, RpcServer, RPC_EXCHANGE};

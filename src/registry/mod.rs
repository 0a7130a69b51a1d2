//! Handler registry — pattern-matched, failure-isolated event dispatch.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    HandlerRegistry                        │
//! │  subscribe(pattern, handler) / unsubscribe(...)          │
//! │  find_handlers(routing_key) -> matching handlers         │
//! │  invoke_all(envelope) -> InvocationResult                │
//! └──────────────────────────────────────────────────────────┘
//!            │ fan-out (one task per handler)
//!            ▼
//! ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//! │  handler A  │  │  handler B  │  │  handler C  │
//! │   (ok)      │  │  (failed)   │  │   (ok)      │
//! └─────────────┘  └─────────────┘  └─────────────┘
//!            │ join — all complete before the result is built
//!            ▼
//!   InvocationResult { succeeded: 2, failures: [B] }
//! ```
//!
//! A failing (or panicking) handler is recorded but never prevents its
//! siblings from running; the aggregate result drives the subscriber's
//! acknowledge/reject decision.

mod handler;
mod registry;

pub use handler::{EventHandler, HandlerError, HandlerFailure, InvocationResult};
pub use registry::HandlerRegistry;

//! Registry of pattern → handler registrations.

use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use super::handler::{EventHandler, HandlerFailure, InvocationResult};
use crate::envelope::Envelope;
use crate::pattern::Pattern;

struct Registration {
    pattern: Pattern,
    handler: Arc<dyn EventHandler>,
}

/// Registry for event handlers with pattern-matched dispatch.
///
/// Thread-safe: subscribe/unsubscribe may run concurrently with lookups.
/// Lookups snapshot the matching handlers under a read lock, so dispatch
/// never observes a half-applied mutation.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use topic_bus::{Envelope, EventHandler, HandlerRegistry};
///
/// struct AuditLog;
///
/// #[async_trait]
/// impl EventHandler for AuditLog {
///     async fn handle(&self, _envelope: &Envelope) -> Result<(), topic_bus::HandlerError> {
///         Ok(())
///     }
/// }
///
/// let registry = HandlerRegistry::new();
/// registry.subscribe("order.*", Arc::new(AuditLog));
/// assert_eq!(registry.find_handlers("order.created").len(), 1);
/// assert_eq!(registry.find_handlers("user.created").len(), 0);
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler under a pattern.
    ///
    /// No uniqueness constraint: registering the same pair twice yields two
    /// invocations at dispatch time. That is intentional, not deduplicated.
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let pattern = Pattern::new(pattern);
        info!(pattern = %pattern, handler = handler.name(), "Registered handler");
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push(Registration { pattern, handler });
    }

    /// Remove exactly one registration of `handler` under `pattern`.
    ///
    /// No-op when no such registration exists. Identity is the handler
    /// instance (`Arc` pointer), not its type.
    pub fn unsubscribe(&self, pattern: &str, handler: &Arc<dyn EventHandler>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let found = entries
            .iter()
            .position(|r| r.pattern.as_str() == pattern && Arc::ptr_eq(&r.handler, handler));
        match found {
            Some(index) => {
                entries.remove(index);
                info!(pattern, handler = handler.name(), "Unregistered handler");
            }
            None => debug!(pattern, "Unsubscribe: no matching registration"),
        }
    }

    /// Number of registrations currently held.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the registry holds no registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find every handler whose pattern matches the routing key.
    ///
    /// Overlapping patterns all fire; the returned order is unspecified.
    pub fn find_handlers(&self, routing_key: &str) -> Vec<Arc<dyn EventHandler>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<Arc<dyn EventHandler>> = entries
            .iter()
            .filter(|r| r.pattern.matches(routing_key))
            .map(|r| Arc::clone(&r.handler))
            .collect();
        debug!(routing_key, count = matching.len(), "Resolved handlers");
        matching
    }

    /// Invoke every matching handler for the envelope's routing key.
    ///
    /// Handlers run on independent tasks and are all joined before the
    /// result is returned. A handler that fails — or panics — is recorded
    /// in the result but never prevents the others from running. Zero
    /// matching handlers is not an error; the result is empty and counts
    /// as success.
    pub async fn invoke_all(&self, envelope: &Envelope) -> InvocationResult {
        let routing_key = envelope.routing_key();
        let handlers = self.find_handlers(&routing_key);

        let mut result = InvocationResult::default();
        if handlers.is_empty() {
            debug!(event_id = %envelope.event_id, %routing_key, "No handlers matched");
            return result;
        }

        let mut tasks = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let name = handler.name();
            let event = envelope.clone();
            let task = tokio::spawn(async move { handler.handle(&event).await });
            tasks.push((name, task));
        }

        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => result.succeeded += 1,
                Ok(Err(e)) => {
                    warn!(handler = name, error = %e, "Handler failed");
                    result.failures.push(HandlerFailure {
                        handler: name.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(join_error) => {
                    warn!(handler = name, error = %join_error, "Handler panicked");
                    result.failures.push(HandlerFailure {
                        handler: name.to_string(),
                        reason: format!("handler panicked: {}", join_error),
                    });
                }
            }
        }

        info!(
            event_id = %envelope.event_id,
            %routing_key,
            succeeded = result.succeeded,
            failed = result.failed(),
            "Handler invocation complete"
        );
        result
    }
}

//! The event-handler capability and per-message invocation results.

use async_trait::async_trait;

use crate::envelope::Envelope;

/// Error type handlers may fail with. Any error works; the registry only
/// records its message.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A capability that can process an [`Envelope`] asynchronously.
///
/// Handlers impose no base type beyond this shape: anything that can
/// `handle` an envelope integrates with the registry. Implementations must
/// be `Send + Sync` because dispatch runs them on independent tasks.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event. A returned error marks this handler as failed for
    /// this message; sibling handlers are unaffected.
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;

    /// Diagnostic name for logs and failure reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// One handler's failure while processing a message.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Diagnostic name of the failing handler.
    pub handler: String,
    /// Why it failed.
    pub reason: String,
}

/// Aggregate outcome of invoking every matching handler for one message.
///
/// This is the input to the subscriber's acknowledge/reject decision:
/// zero failures → acknowledge, any failure → reject. There is no partial
/// acknowledgment.
#[derive(Debug, Default)]
pub struct InvocationResult {
    /// Handlers that completed successfully.
    pub succeeded: usize,
    /// Handlers that failed, with reasons.
    pub failures: Vec<HandlerFailure>,
}

impl InvocationResult {
    /// Number of handlers that failed.
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Total number of handlers invoked.
    pub fn invoked(&self) -> usize {
        self.succeeded + self.failures.len()
    }

    /// True when no handler failed (including when none matched).
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

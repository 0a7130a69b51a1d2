//! Event envelope — the wire format for domain events.
//!
//! An [`Envelope`] records that something happened in a business domain:
//! `domain` names the business area ("order"), `action` names what occurred
//! ("created"), and `data` carries the JSON payload. Identity and provenance
//! (`event_id`, `timestamp`, `version`) are filled in at construction and
//! never change afterwards.
//!
//! The routing key is derived, not stored: [`Envelope::routing_key`] is
//! always `"{domain}.{action}"`, recomputed on demand so it can never drift
//! from its inputs.
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use topic_bus::Envelope;
//!
//! let event = Envelope::new("order", "created").with_entry("id", json!("123"));
//!
//! assert_eq!(event.routing_key(), "order.created");
//!
//! let bytes = event.to_bytes().unwrap();
//! let decoded = Envelope::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded.event_id, event.event_id);
//! ```

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

/// Default schema version stamped on new envelopes.
pub const ENVELOPE_VERSION: &str = "1.0";

fn default_version() -> String {
    ENVELOPE_VERSION.to_string()
}

/// A domain event as it travels over the wire.
///
/// All six fields are encoded as a flat JSON object. `data` and `version`
/// are optional on the wire (defaulting to `{}` and `"1.0"`); the other
/// four fields are required and decoding fails without them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Business area this event belongs to (e.g. "order", "user").
    pub domain: String,
    /// What happened (e.g. "created", "updated").
    pub action: String,
    /// Event payload. Restricted to JSON values by construction.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Unique identifier, assigned at construction.
    pub event_id: String,
    /// RFC 3339 timestamp of construction.
    pub timestamp: String,
    /// Schema version for compatibility.
    #[serde(default = "default_version")]
    pub version: String,
}

impl Envelope {
    /// Create a new envelope with an empty payload.
    ///
    /// `event_id` and `timestamp` are generated; `version` defaults to
    /// [`ENVELOPE_VERSION`].
    pub fn new(domain: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            action: action.into(),
            data: Map::new(),
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: default_version(),
        }
    }

    /// Replace the payload map.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Add a single payload entry.
    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Override the schema version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Derive the routing key for this event: `"{domain}.{action}"`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.domain, self.action)
    }

    /// Encode the envelope as a JSON byte payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
        debug!(event_id = %self.event_id, bytes = bytes.len(), "Serialized envelope");
        Ok(bytes)
    }

    /// Decode an envelope from a JSON byte payload.
    ///
    /// Fails with [`EnvelopeError::Malformed`] when the payload is not a
    /// JSON object, when `domain`, `action`, `event_id` or `timestamp` is
    /// absent, when `domain` or `action` is empty, or when `data` is not an
    /// object.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if envelope.domain.is_empty() {
            return Err(EnvelopeError::Malformed("empty domain".to_string()));
        }
        if envelope.action.is_empty() {
            return Err(EnvelopeError::Malformed("empty action".to_string()));
        }

        debug!(event_id = %envelope.event_id, routing_key = %envelope.routing_key(), "Deserialized envelope");
        Ok(envelope)
    }
}

/// Error type for envelope encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The payload is not a valid envelope (bad JSON, missing or empty
    /// required fields, non-object `data`).
    Malformed(String),
    /// Encoding the envelope failed.
    Serialize(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Malformed(msg) => write!(f, "malformed envelope: {}", msg),
            EnvelopeError::Serialize(msg) => write!(f, "envelope serialization failed: {}", msg),
        }
    }
}

impl std::error::Error for EnvelopeError {}

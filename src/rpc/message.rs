//! RPC wire messages.
//!
//! Plain JSON objects so calls interoperate across services regardless of
//! implementation language.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default call timeout when a request does not carry one.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

fn default_timeout() -> f64 {
    DEFAULT_RPC_TIMEOUT.as_secs_f64()
}

/// One remote procedure call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Name of the method to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Unique identifier correlating the response to this request.
    pub request_id: String,
    /// RFC 3339 timestamp of construction.
    pub timestamp: String,
    /// Caller-chosen timeout in seconds, propagated so the server can
    /// honor it too.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

impl RpcRequest {
    /// Create a request with a fresh `request_id`.
    pub fn new(method: impl Into<String>, params: Map<String, Value>, timeout: Duration) -> Self {
        Self {
            method: method.into(),
            params,
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            timeout: timeout.as_secs_f64(),
        }
    }

    /// The request's timeout as a [`Duration`].
    ///
    /// Falls back to [`DEFAULT_RPC_TIMEOUT`] when the wire value is not a
    /// representable positive duration (zero, negative, NaN, infinite, or
    /// too large). The request comes off the wire, so this never panics.
    pub fn timeout_duration(&self) -> Duration {
        if self.timeout > 0.0 {
            Duration::try_from_secs_f64(self.timeout).unwrap_or(DEFAULT_RPC_TIMEOUT)
        } else {
            DEFAULT_RPC_TIMEOUT
        }
    }

    /// Encode as JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Machine-readable failure category carried in an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    /// No method registered under the requested name.
    MethodNotFound,
    /// The method did not complete within the request's timeout.
    Timeout,
    /// The method itself failed.
    MethodError,
}

/// Structured failure reason carried in an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Failure category.
    pub code: RpcErrorCode,
    /// Human-readable reason.
    pub message: String,
}

impl std::fmt::Display for RpcErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// The server's answer to one request.
///
/// `result` is present iff `success`; `error` is present iff not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Equals the request's `request_id`.
    pub request_id: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Call result, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure reason, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    /// RFC 3339 timestamp of construction.
    pub timestamp: String,
}

impl RpcResponse {
    /// Build a success response.
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            result: Some(result),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Build a failure response.
    pub fn failure(
        request_id: impl Into<String>,
        code: RpcErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            result: None,
            error: Some(RpcErrorBody {
                code,
                message: message.into(),
            }),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Encode as JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let mut params = Map::new();
        params.insert("a".to_string(), json!(2));
        let request = RpcRequest::new("add", params, Duration::from_secs(5));

        let bytes = request.to_bytes().unwrap();
        let decoded = RpcRequest::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.method, "add");
        assert_eq!(decoded.params["a"], json!(2));
        assert_eq!(decoded.request_id, request.request_id);
        assert_eq!(decoded.timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn request_defaults_params_and_timeout() {
        let raw = r#"{"method":"ping","request_id":"r1","timestamp":"t1"}"#;
        let decoded = RpcRequest::from_bytes(raw.as_bytes()).unwrap();
        assert!(decoded.params.is_empty());
        assert_eq!(decoded.timeout_duration(), DEFAULT_RPC_TIMEOUT);
    }

    #[test]
    fn nonsensical_timeout_falls_back_to_default() {
        let raw = r#"{"method":"ping","request_id":"r1","timestamp":"t1","timeout":-2}"#;
        let decoded = RpcRequest::from_bytes(raw.as_bytes()).unwrap();
        assert_eq!(decoded.timeout_duration(), DEFAULT_RPC_TIMEOUT);
    }

    #[test]
    fn unrepresentable_timeout_falls_back_to_default() {
        // Valid JSON numbers that no Duration can hold must not panic.
        for raw in [
            r#"{"method":"ping","request_id":"r1","timestamp":"t1","timeout":1e30}"#,
            r#"{"method":"ping","request_id":"r1","timestamp":"t1","timeout":1e308}"#,
        ] {
            let decoded = RpcRequest::from_bytes(raw.as_bytes()).unwrap();
            assert_eq!(decoded.timeout_duration(), DEFAULT_RPC_TIMEOUT);
        }
    }

    #[test]
    fn success_response_carries_result_only() {
        let response = RpcResponse::success("r1", json!(5));
        let bytes = response.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("error"));

        let decoded = RpcResponse::from_bytes(&bytes).unwrap();
        assert!(decoded.success);
        assert_eq!(decoded.result, Some(json!(5)));
        assert!(decoded.error.is_none());
    }

    #[test]
    fn failure_response_carries_structured_error() {
        let response = RpcResponse::failure("r1", RpcErrorCode::MethodNotFound, "no such method");
        let bytes = response.to_bytes().unwrap();
        let decoded = RpcResponse::from_bytes(&bytes).unwrap();

        assert!(!decoded.success);
        assert!(decoded.result.is_none());
        let error = decoded.error.unwrap();
        assert_eq!(error.code, RpcErrorCode::MethodNotFound);
        assert_eq!(error.message, "no such method");
    }

    #[test]
    fn error_code_uses_snake_case_on_the_wire() {
        let response = RpcResponse::failure("r1", RpcErrorCode::MethodNotFound, "x");
        let text = String::from_utf8(response.to_bytes().unwrap()).unwrap();
        assert!(text.contains("method_not_found"));
    }
}

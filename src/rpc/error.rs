//! Error type for RPC calls.

use std::fmt;
use std::time::Duration;

use crate::broker::BrokerError;

use super::message::RpcErrorBody;

/// Error type for client-side RPC operations.
#[derive(Debug)]
pub enum RpcError {
    /// No matching response arrived within the caller's timeout. This is a
    /// client-local bound; work already started server-side continues.
    Timeout(Duration),
    /// The server answered with an error response.
    Remote(RpcErrorBody),
    /// Transport-level failure.
    Broker(BrokerError),
    /// A message could not be encoded or decoded.
    Codec(String),
    /// `call` was invoked before `setup()`.
    NotReady,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Timeout(timeout) => {
                write!(f, "rpc call timed out after {:.3}s", timeout.as_secs_f64())
            }
            RpcError::Remote(body) => write!(f, "rpc call failed: {}", body),
            RpcError::Broker(e) => write!(f, "rpc transport error: {}", e),
            RpcError::Codec(msg) => write!(f, "rpc codec error: {}", msg),
            RpcError::NotReady => write!(f, "rpc client not set up; call setup() first"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Broker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BrokerError> for RpcError {
    fn from(err: BrokerError) -> Self {
        RpcError::Broker(err)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

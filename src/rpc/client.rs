//! RPC client — publishes requests and awaits correlated responses.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerError, ConsumeOptions, DeliveryStream, ExchangeKind, MessageProperties, QueueOptions,
};
use crate::connection::ConnectionManager;

use super::error::RpcError;
use super::message::{RpcRequest, RpcResponse};
use super::server::RPC_EXCHANGE;

/// Calls remote methods and waits for their responses.
///
/// Each client owns an exclusive, auto-deleted reply queue; responses are
/// matched to calls by `request_id`. The timeout passed to [`call`] is a
/// client-local bound: when it elapses the call returns
/// [`RpcError::Timeout`], and any response that arrives later is discarded
/// on the next call's receive loop.
///
/// ## Example
///
/// ```ignore
/// let mut client = RpcClient::new(connection);
/// client.connect().await?;
/// client.setup().await?;
///
/// let mut params = Map::new();
/// params.insert("a".into(), json!(2));
/// params.insert("b".into(), json!(3));
/// let sum = client
///     .call("add", params, "math-service", Duration::from_secs(5))
///     .await?;
/// ```
///
/// [`call`]: Self::call
pub struct RpcClient {
    connection: ConnectionManager,
    exchange: String,
    reply_queue: Option<String>,
    replies: Option<DeliveryStream>,
}

impl RpcClient {
    /// Create a client on the default RPC exchange.
    pub fn new(connection: ConnectionManager) -> Self {
        Self::with_exchange(connection, RPC_EXCHANGE)
    }

    /// Create a client on an explicit exchange.
    pub fn with_exchange(connection: ConnectionManager, exchange: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
            reply_queue: None,
            replies: None,
        }
    }

    /// Connect the underlying session.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.connection.connect().await
    }

    /// Declare the RPC exchange and this client's reply queue.
    ///
    /// The reply queue gets a broker-generated name, is exclusive to this
    /// client's session, and is deleted with it.
    pub async fn setup(&mut self) -> Result<(), BrokerError> {
        self.connection
            .declare_exchange(&self.exchange, ExchangeKind::Direct, true)
            .await?;
        let options = QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter_queue: None,
        };
        let reply_queue = self.connection.declare_queue("", options).await?;
        let consume = ConsumeOptions {
            prefetch: 0,
            auto_ack: true,
        };
        let replies = self.connection.consume(&reply_queue, consume).await?;
        info!(reply_queue = %reply_queue, "RPC client ready");
        self.reply_queue = Some(reply_queue);
        self.replies = Some(replies);
        Ok(())
    }

    /// Call `method` on the service consuming from `routing_key` and wait
    /// up to `timeout` for its response.
    pub async fn call(
        &mut self,
        method: &str,
        params: Map<String, Value>,
        routing_key: &str,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let reply_queue = self.reply_queue.clone().ok_or(RpcError::NotReady)?;
        if self.replies.is_none() {
            return Err(RpcError::NotReady);
        }

        let request = RpcRequest::new(method, params, timeout);
        let request_id = request.request_id.clone();
        let payload = request.to_bytes()?;
        let properties = MessageProperties {
            content_type: Some("application/json".to_string()),
            correlation_id: Some(request_id.clone()),
            reply_to: Some(reply_queue),
            ..MessageProperties::default()
        };
        debug!(method, request_id = %request_id, routing_key, "RPC request sent");
        self.connection
            .publish(&self.exchange, routing_key, payload, properties)
            .await?;

        let deadline = Instant::now() + timeout;
        let replies = self.replies.as_mut().ok_or(RpcError::NotReady)?;
        loop {
            let delivery = match tokio::time::timeout_at(deadline, replies.recv()).await {
                Err(_) => {
                    warn!(method, request_id = %request_id, "RPC call timed out");
                    return Err(RpcError::Timeout(timeout));
                }
                Ok(None) => return Err(RpcError::Broker(BrokerError::Closed)),
                Ok(Some(delivery)) => delivery,
            };

            let response = match RpcResponse::from_bytes(&delivery.payload) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Discarding unparseable RPC response");
                    continue;
                }
            };
            let correlation = delivery
                .properties
                .correlation_id
                .unwrap_or_else(|| response.request_id.clone());
            if correlation != request_id {
                // Late response for a call that already timed out.
                debug!(correlation_id = %correlation, "Discarding uncorrelated RPC response");
                continue;
            }

            return match response.error {
                Some(body) => {
                    warn!(method, request_id = %request_id, error = %body, "RPC call failed");
                    Err(RpcError::Remote(body))
                }
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
        }
    }

    /// Close the underlying session, dropping the reply queue with it.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.replies = None;
        self.reply_queue = None;
        self.connection.close().await
    }
}

//! RPC server — consumes requests, dispatches methods, replies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerError, ConsumeOptions, Delivery, ExchangeKind, MessageProperties, QueueOptions,
};
use crate::bus::StopHandle;
use crate::connection::ConnectionManager;

use super::message::{RpcErrorCode, RpcRequest, RpcResponse};

/// Default exchange for RPC traffic.
pub const RPC_EXCHANGE: &str = "rpc";

/// Error type methods may fail with; the server converts it into an error
/// response, never a crash.
pub type MethodError = Box<dyn std::error::Error + Send + Sync>;

/// An asynchronous operation callable by name over RPC.
///
/// Takes a params mapping and returns a JSON value. Like event handlers,
/// methods impose no base type beyond this shape.
#[async_trait]
pub trait RpcMethod: Send + Sync {
    /// Execute the method.
    async fn call(&self, params: Map<String, Value>) -> Result<Value, MethodError>;
}

/// Serves RPC requests from a named queue.
///
/// Lifecycle: created → configured (methods registered, [`setup`] done) →
/// running ([`start`]) → stopped (via [`stop_handle`]).
///
/// Every request that reaches a running server yields exactly one
/// response: unknown methods produce a `method_not_found` error response,
/// a method overrunning the request's own timeout produces a `timeout`
/// error response, and a failing or panicking method produces a
/// `method_error` response. Nothing propagates far enough to crash the
/// consume loop.
///
/// ## Example
///
/// ```ignore
/// let mut server = RpcServer::new(connection, "math-service");
/// server.register_method("add", Arc::new(Add));
/// server.connect().await?;
/// server.setup().await?;
/// tokio::spawn(async move { server.start().await });
/// ```
///
/// [`setup`]: Self::setup
/// [`start`]: Self::start
/// [`stop_handle`]: Self::stop_handle
pub struct RpcServer {
    connection: ConnectionManager,
    queue: String,
    exchange: String,
    methods: HashMap<String, Arc<dyn RpcMethod>>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl RpcServer {
    /// Create a server consuming from `queue` on the default RPC exchange.
    pub fn new(connection: ConnectionManager, queue: impl Into<String>) -> Self {
        Self::with_exchange(connection, queue, RPC_EXCHANGE)
    }

    /// Create a server on an explicit exchange.
    pub fn with_exchange(
        connection: ConnectionManager,
        queue: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let queue = queue.into();
        info!(queue = %queue, "RpcServer created");
        Self {
            connection,
            queue,
            exchange: exchange.into(),
            methods: HashMap::new(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// Register a method under a name. A later registration under the same
    /// name replaces the earlier one.
    pub fn register_method(&mut self, name: impl Into<String>, method: Arc<dyn RpcMethod>) {
        let name = name.into();
        info!(method = %name, "Registered RPC method");
        self.methods.insert(name, method);
    }

    /// Connect the underlying session.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.connection.connect().await
    }

    /// Declare the RPC exchange and the request queue, bound by the
    /// queue's own name.
    pub async fn setup(&mut self) -> Result<(), BrokerError> {
        self.connection
            .declare_exchange(&self.exchange, ExchangeKind::Direct, true)
            .await?;
        self.connection
            .declare_queue(&self.queue, QueueOptions::default())
            .await?;
        self.connection
            .bind_queue(&self.queue, &self.exchange, &self.queue)
            .await?;
        info!(queue = %self.queue, exchange = %self.exchange, "RPC server setup complete");
        Ok(())
    }

    /// A handle that stops [`start`](Self::start) from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::from_sender(Arc::clone(&self.stop_tx))
    }

    /// Consume requests until stopped or the session ends.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        let options = ConsumeOptions {
            prefetch: 1,
            auto_ack: false,
        };
        let mut deliveries = self.connection.consume(&self.queue, options).await?;
        let mut stop = self.stop_rx.clone();
        info!(queue = %self.queue, "RPC server started");

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.handle_request(delivery).await?,
                    None => break,
                },
            }
        }

        info!(queue = %self.queue, "RPC server stopped");
        Ok(())
    }

    /// Settle one request: dispatch, reply, acknowledge.
    async fn handle_request(&mut self, delivery: Delivery) -> Result<(), BrokerError> {
        let tag = delivery.delivery_tag;

        let request = match RpcRequest::from_bytes(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Rejecting malformed RPC request");
                return self.connection.nack(tag, false).await;
            }
        };
        info!(method = %request.method, request_id = %request.request_id, "RPC request received");

        let response = self.execute(&request).await;

        match delivery.properties.reply_to {
            Some(reply_to) => match response.to_bytes() {
                Ok(payload) => {
                    let properties = MessageProperties {
                        content_type: Some("application/json".to_string()),
                        correlation_id: Some(request.request_id.clone()),
                        ..MessageProperties::default()
                    };
                    // The reply queue may be gone if the caller gave up
                    // and its exclusive queue was deleted; the response is
                    // simply undeliverable then.
                    if let Err(e) = self
                        .connection
                        .publish("", &reply_to, payload, properties)
                        .await
                    {
                        warn!(
                            request_id = %request.request_id,
                            error = %e,
                            "Could not deliver RPC response"
                        );
                    } else {
                        debug!(request_id = %request.request_id, "RPC response sent");
                    }
                }
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "Could not encode RPC response");
                }
            },
            None => {
                debug!(request_id = %request.request_id, "Request carried no reply_to; response discarded");
            }
        }

        self.connection.ack(tag).await
    }

    /// Run the requested method under the request's own timeout.
    async fn execute(&self, request: &RpcRequest) -> RpcResponse {
        let Some(method) = self.methods.get(&request.method) else {
            warn!(method = %request.method, "RPC method not found");
            return RpcResponse::failure(
                &request.request_id,
                RpcErrorCode::MethodNotFound,
                format!("method '{}' not found", request.method),
            );
        };

        let method = Arc::clone(method);
        let params = request.params.clone();
        // Run on its own task so a panicking method becomes an error
        // response instead of tearing down the consume loop.
        let mut invocation = tokio::spawn(async move { method.call(params).await });

        match tokio::time::timeout(request.timeout_duration(), &mut invocation).await {
            Err(_) => {
                // Cancel the overrunning method; its result has no recipient.
                invocation.abort();
                warn!(method = %request.method, request_id = %request.request_id, "RPC method timed out");
                RpcResponse::failure(
                    &request.request_id,
                    RpcErrorCode::Timeout,
                    format!(
                        "method '{}' did not complete within {:.3}s",
                        request.method, request.timeout
                    ),
                )
            }
            Ok(Err(join_error)) => {
                warn!(method = %request.method, error = %join_error, "RPC method panicked");
                RpcResponse::failure(
                    &request.request_id,
                    RpcErrorCode::MethodError,
                    format!("method '{}' panicked: {}", request.method, join_error),
                )
            }
            Ok(Ok(Err(e))) => {
                warn!(method = %request.method, error = %e, "RPC method failed");
                RpcResponse::failure(&request.request_id, RpcErrorCode::MethodError, e.to_string())
            }
            Ok(Ok(Ok(value))) => RpcResponse::success(&request.request_id, value),
        }
    }

    /// Close the underlying session.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.connection.close().await
    }
}

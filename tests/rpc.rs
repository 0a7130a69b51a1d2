//! End-to-end RPC over the in-memory broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use topic_bus::broker::{ConsumeOptions, InMemoryBroker, MessageProperties, QueueOptions};
use topic_bus::rpc::{RpcErrorCode, RpcRequest, RpcResponse, RPC_EXCHANGE};
use topic_bus::{ConnectionConfig, ConnectionManager, MethodError, RpcClient, RpcError, RpcMethod, RpcServer};

const SERVICE: &str = "math-service";

struct Add;

#[async_trait]
impl RpcMethod for Add {
    async fn call(&self, params: Map<String, Value>) -> Result<Value, MethodError> {
        let a = params
            .get("a")
            .and_then(Value::as_i64)
            .ok_or("missing parameter 'a'")?;
        let b = params
            .get("b")
            .and_then(Value::as_i64)
            .ok_or("missing parameter 'b'")?;
        Ok(json!(a + b))
    }
}

struct Sleepy;

#[async_trait]
impl RpcMethod for Sleepy {
    async fn call(&self, _params: Map<String, Value>) -> Result<Value, MethodError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

/// Resets `active` when the method future is dropped.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Stuck {
    started: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

#[async_trait]
impl RpcMethod for Stuck {
    async fn call(&self, _params: Map<String, Value>) -> Result<Value, MethodError> {
        self.started.store(true, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        let _guard = ActiveGuard(self.active.clone());
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

fn connection(broker: &InMemoryBroker) -> ConnectionManager {
    ConnectionManager::new(Arc::new(broker.clone()), ConnectionConfig::default())
}

async fn spawn_server(broker: &InMemoryBroker) -> topic_bus::StopHandle {
    let mut server = RpcServer::new(connection(broker), SERVICE);
    server.register_method("add", Arc::new(Add));
    server.register_method("sleep", Arc::new(Sleepy));
    server.connect().await.unwrap();
    server.setup().await.unwrap();
    let stop = server.stop_handle();
    tokio::spawn(async move { server.start().await });
    stop
}

fn add_params(a: i64, b: i64) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("a".to_string(), json!(a));
    params.insert("b".to_string(), json!(b));
    params
}

#[tokio::test]
async fn call_returns_the_method_result() {
    let broker = InMemoryBroker::new();
    let stop = spawn_server(&broker).await;

    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();
    client.setup().await.unwrap();

    let result = client
        .call("add", add_params(2, 3), SERVICE, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!(5));

    // The same client makes further calls on the same reply queue.
    let result = client
        .call("add", add_params(40, 2), SERVICE, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    stop.stop();
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let broker = InMemoryBroker::new();
    let stop = spawn_server(&broker).await;

    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();
    client.setup().await.unwrap();

    let err = client
        .call("multiply", add_params(2, 3), SERVICE, Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(body) => {
            assert_eq!(body.code, RpcErrorCode::MethodNotFound);
            assert!(body.message.contains("multiply"));
        }
        other => panic!("expected remote error, got {other}"),
    }

    stop.stop();
}

#[tokio::test]
async fn failing_method_yields_method_error() {
    let broker = InMemoryBroker::new();
    let stop = spawn_server(&broker).await;

    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();
    client.setup().await.unwrap();

    // Missing parameters make the method itself fail.
    let err = client
        .call("add", Map::new(), SERVICE, Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(body) => {
            assert_eq!(body.code, RpcErrorCode::MethodError);
            assert!(body.message.contains("missing parameter"));
        }
        other => panic!("expected remote error, got {other}"),
    }

    stop.stop();
}

#[tokio::test]
async fn call_without_a_server_times_out_locally() {
    let broker = InMemoryBroker::new();

    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();
    client.setup().await.unwrap();

    let err = client
        .call("add", add_params(2, 3), SERVICE, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));
}

#[tokio::test]
async fn call_before_setup_fails_fast() {
    let broker = InMemoryBroker::new();

    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();

    let err = client
        .call("add", add_params(2, 3), SERVICE, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotReady));
}

#[tokio::test]
async fn server_enforces_the_request_timeout() {
    let broker = InMemoryBroker::new();
    let stop = spawn_server(&broker).await;

    // Drive the wire protocol directly so the server's timeout response can
    // be observed even after the caller would have given up.
    let mut session = connection(&broker);
    session.connect().await.unwrap();
    let reply_queue = session
        .declare_queue(
            "",
            QueueOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                dead_letter_queue: None,
            },
        )
        .await
        .unwrap();
    let mut replies = session
        .consume(
            &reply_queue,
            ConsumeOptions {
                prefetch: 0,
                auto_ack: true,
            },
        )
        .await
        .unwrap();

    let request = RpcRequest::new("sleep", Map::new(), Duration::from_millis(50));
    let properties = MessageProperties {
        reply_to: Some(reply_queue),
        correlation_id: Some(request.request_id.clone()),
        content_type: Some("application/json".to_string()),
        ..MessageProperties::default()
    };
    session
        .publish(RPC_EXCHANGE, SERVICE, request.to_bytes().unwrap(), properties)
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), replies.recv())
        .await
        .expect("server never responded")
        .expect("reply stream closed");
    let response = RpcResponse::from_bytes(&delivery.payload).unwrap();

    assert_eq!(response.request_id, request.request_id);
    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, RpcErrorCode::Timeout);

    stop.stop();
}

#[tokio::test]
async fn oversized_wire_timeout_does_not_crash_the_server() {
    let broker = InMemoryBroker::new();
    let stop = spawn_server(&broker).await;

    // A timeout no Duration can hold, straight off the wire, no reply_to.
    let mut admin = connection(&broker);
    admin.connect().await.unwrap();
    let raw = br#"{"method":"add","params":{"a":1,"b":1},"request_id":"r-huge","timestamp":"t","timeout":1e30}"#;
    admin
        .publish(
            RPC_EXCHANGE,
            SERVICE,
            raw.to_vec(),
            MessageProperties::default(),
        )
        .await
        .unwrap();

    // The loop is still serving calls afterwards.
    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();
    client.setup().await.unwrap();
    let result = client
        .call("add", add_params(2, 3), SERVICE, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!(5));

    stop.stop();
}

#[tokio::test]
async fn timed_out_method_is_cancelled() {
    let broker = InMemoryBroker::new();
    let started = Arc::new(AtomicBool::new(false));
    let active = Arc::new(AtomicBool::new(false));

    let mut server = RpcServer::new(connection(&broker), SERVICE);
    server.register_method(
        "stuck",
        Arc::new(Stuck {
            started: started.clone(),
            active: active.clone(),
        }),
    );
    server.connect().await.unwrap();
    server.setup().await.unwrap();
    let stop = server.stop_handle();
    tokio::spawn(async move { server.start().await });

    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();
    client.setup().await.unwrap();

    // The outcome (local or remote timeout) is not the point here.
    let _ = client
        .call("stuck", Map::new(), SERVICE, Duration::from_millis(50))
        .await;

    // The server cancelled the method task instead of leaving it running.
    for _ in 0..100 {
        if started.load(Ordering::SeqCst) && !active.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(started.load(Ordering::SeqCst));
    assert!(!active.load(Ordering::SeqCst));

    stop.stop();
}

#[tokio::test]
async fn late_response_is_discarded_on_the_next_call() {
    let broker = InMemoryBroker::new();
    let stop = spawn_server(&broker).await;

    let mut client = RpcClient::new(connection(&broker));
    client.connect().await.unwrap();
    client.setup().await.unwrap();

    // Occupy the server first so the next call is still queued when its
    // caller gives up. No reply_to: the server discards this response.
    let mut admin = connection(&broker);
    admin.connect().await.unwrap();
    let busy = RpcRequest::new("sleep", Map::new(), Duration::from_millis(300));
    admin
        .publish(
            RPC_EXCHANGE,
            SERVICE,
            busy.to_bytes().unwrap(),
            MessageProperties::default(),
        )
        .await
        .unwrap();

    // The sleepy call times out client-side; the server's timeout error
    // response lands in the reply queue after the client gave up.
    let err = client
        .call("sleep", Map::new(), SERVICE, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    // The next call skips the stale response and correlates its own.
    let result = client
        .call("add", add_params(2, 3), SERVICE, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!(5));

    stop.stop();
}

//! WebSocket hub client against an in-test hub server

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use protolock::{
    Capability, ConnectionId, ConnectionState, CoordinatorConfig, DeviceIdentity, EventSink, HubConnection, HubEvent,
    HubOptions, LockCoordinator, MemoryStore, RetryPolicy, TransportError, TransportEvent, WsHubConnection,
    WsHubFactory,
};

const WAIT: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

fn frame(value: Value) -> String {
    format!("{value}\u{1e}")
}

fn test_options() -> HubOptions {
    HubOptions {
        retry: RetryPolicy::from_millis(&[0, 50], Some(3)),
        handshake_timeout: Duration::from_secs(2),
        invoke_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/hubs/protocol", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

/// Answer the client handshake, appending `extra` to the same frame
async fn handshake(ws: &mut ServerWs, response: &str, extra: &str) {
    let message = ws.next().await.unwrap().unwrap();
    let text = message.into_text().unwrap();
    let request: Value = serde_json::from_str(text.as_str().trim_end_matches('\u{1e}')).unwrap();
    assert_eq!(request, json!({"protocol": "json", "version": 1}));
    ws.send(Message::text(format!("{response}\u{1e}{extra}"))).await.unwrap();
}

/// Next non-ping message the client sent
async fn next_client_message(ws: &mut ServerWs) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        let Message::Text(text) = message else { continue };
        for part in text.as_str().split('\u{1e}').filter(|p| !p.is_empty()) {
            let value: Value = serde_json::from_str(part).unwrap();
            if value["type"] != 6 {
                return value;
            }
        }
    }
}

fn connection(url: &str) -> (Arc<WsHubConnection>, mpsc::UnboundedReceiver<HubEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = WsHubConnection::new(ConnectionId(1), url, test_options(), EventSink::new(ConnectionId(1), tx));
    (Arc::new(conn), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<HubEvent>) -> TransportEvent {
    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.connection, ConnectionId(1));
    event.event
}

#[tokio::test]
async fn test_handshake_and_initial_snapshot() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let active = frame(json!({"type": 1, "target": "ActiveLocks", "arguments": [{"42": "Tablet 2"}]}));
        handshake(&mut ws, "{}", &active).await;
        // Keep the socket open until the client closes it
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let (conn, mut rx) = connection(&url);
    conn.start().await.unwrap();

    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Invocation {
            target: "ActiveLocks".to_string(),
            arguments: vec![json!({"42": "Tablet 2"})],
        }
    );

    conn.stop().await.unwrap();
    assert_eq!(next_event(&mut rx).await, TransportEvent::Closed { error: None });
    server.await.unwrap();
}

#[tokio::test]
async fn test_handshake_error_fails_start() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, r#"{"error":"Requested protocol 'json' is not available."}"#, "").await;
    });

    let (conn, _rx) = connection(&url);
    let result = conn.start().await;
    assert!(matches!(result, Err(TransportError::Handshake(message)) if message.contains("not available")));
    server.await.unwrap();
}

#[tokio::test]
async fn test_invoke_waits_for_completion_and_sees_broadcast() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, "{}", "").await;

        let invocation = next_client_message(&mut ws).await;
        assert_eq!(invocation["type"], 1);
        assert_eq!(invocation["target"], "LockProtocol");
        assert_eq!(invocation["arguments"], json!(["42", "Tablet 1"]));
        let invocation_id = invocation["invocationId"].as_str().unwrap().to_string();

        // Broadcast and completion in one frame
        let reply = format!(
            "{}{}",
            frame(json!({"type": 1, "target": "ProtocolLocked", "arguments": ["42", "Tablet 1"]})),
            frame(json!({"type": 3, "invocationId": invocation_id, "result": null}))
        );
        ws.send(Message::text(reply)).await.unwrap();
        ws
    });

    let (conn, mut rx) = connection(&url);
    conn.start().await.unwrap();
    let result = conn.invoke("LockProtocol", vec![json!("42"), json!("Tablet 1")]).await;
    assert_eq!(result.unwrap(), Value::Null);

    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Invocation {
            target: "ProtocolLocked".to_string(),
            arguments: vec![json!("42"), json!("Tablet 1")],
        }
    );

    let _ws = server.await.unwrap();
    conn.stop().await.unwrap();
}

#[tokio::test]
async fn test_completion_error_is_invocation_error() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, "{}", "").await;
        let invocation = next_client_message(&mut ws).await;
        let invocation_id = invocation["invocationId"].as_str().unwrap().to_string();
        ws.send(Message::text(frame(
            json!({"type": 3, "invocationId": invocation_id, "error": "Protocol not found"}),
        )))
        .await
        .unwrap();
        ws
    });

    let (conn, _rx) = connection(&url);
    conn.start().await.unwrap();
    let result = conn.invoke("UnlockProtocol", vec![json!("404")]).await;
    assert!(matches!(result, Err(TransportError::Invocation(message)) if message == "Protocol not found"));

    let _ws = server.await.unwrap();
    conn.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_drop() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        handshake(&mut first, "{}", "").await;
        drop(first);

        let mut second = accept(&listener).await;
        let active = frame(json!({"type": 1, "target": "ActiveLocks", "arguments": [{}]}));
        handshake(&mut second, "{}", &active).await;
        second
    });

    let (conn, mut rx) = connection(&url);
    conn.start().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, TransportEvent::Reconnecting { .. }));
    assert_eq!(next_event(&mut rx).await, TransportEvent::Reconnected);
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Invocation { target, .. } if target == "ActiveLocks"
    ));

    let _second = server.await.unwrap();
    conn.stop().await.unwrap();
    assert_eq!(next_event(&mut rx).await, TransportEvent::Closed { error: None });
}

#[tokio::test]
async fn test_server_close_without_reconnect_closes() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let close = frame(json!({"type": 7, "error": "Server is shutting down"}));
        handshake(&mut ws, "{}", &close).await;
        ws
    });

    let (conn, mut rx) = connection(&url);
    conn.start().await.unwrap();
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Closed {
            error: Some("Server is shutting down".to_string())
        }
    );

    let _ws = server.await.unwrap();
    // Already closed by the server; stopping is still fine
    conn.stop().await.unwrap();
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws, "{}", "").await;
        // Stop listening so every reconnect is refused
        drop(listener);
    });

    let (conn, mut rx) = connection(&url);
    conn.start().await.unwrap();
    server.await.unwrap();

    assert!(matches!(next_event(&mut rx).await, TransportEvent::Reconnecting { .. }));
    assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed { error: Some(_) }));
    conn.stop().await.unwrap();
}

#[tokio::test]
async fn test_coordinator_over_websocket() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let active = frame(json!({"type": 1, "target": "ActiveLocks", "arguments": [{"7": "Tablet 4"}]}));
        handshake(&mut ws, "{}", &active).await;

        // Echo the lock request as the hub would
        let invocation = next_client_message(&mut ws).await;
        let invocation_id = invocation["invocationId"].as_str().unwrap().to_string();
        let arguments = invocation["arguments"].clone();
        let reply = format!(
            "{}{}",
            frame(json!({"type": 1, "target": "ProtocolLocked", "arguments": arguments})),
            frame(json!({"type": 3, "invocationId": invocation_id}))
        );
        ws.send(Message::text(reply)).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let identity = Arc::new(DeviceIdentity::new(Arc::new(MemoryStore::new())));
    let coordinator = LockCoordinator::new(
        CoordinatorConfig::default(),
        Capability::LockCapable,
        identity,
        Arc::new(WsHubFactory::new(url, test_options())),
    );
    let handle = coordinator.handle();
    tokio::spawn(coordinator.run());

    handle.connect().await.unwrap();
    let mut views = handle.watch();
    tokio::time::timeout(WAIT, views.wait_for(|view| view.is_connected() && view.locks.is_locked("7")))
        .await
        .unwrap()
        .unwrap();

    handle.lock("42").await.unwrap();
    tokio::time::timeout(WAIT, views.wait_for(|view| view.locks.holder("42") == Some("Tablet 1")))
        .await
        .unwrap()
        .unwrap();

    handle.shutdown().await.unwrap();
    server.await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

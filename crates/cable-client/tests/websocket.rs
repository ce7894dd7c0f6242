use std::time::Duration;

use cable_client::{Callbacks, ConnectionState, Consumer, ConsumerConfig, create_consumer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;
type TestResult = Result<(), Box<dyn std::error::Error>>;

struct MockCableServer {
    listener: TcpListener,
    port: u16,
}

impl MockCableServer {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}/cable", self.port)
    }

    /// Accept one connection, selecting `protocol`. Returns the socket and
    /// the protocols the client offered.
    async fn accept_with(
        &self,
        protocol: &'static str,
    ) -> Result<(WsStream, Option<String>), Box<dyn std::error::Error>> {
        let (tcp, _) = tokio::time::timeout(TIMEOUT, self.listener.accept()).await??;
        let mut offered = None;
        let ws = tokio_tungstenite::accept_hdr_async(
            tcp,
            |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                offered = request
                    .headers()
                    .get(SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
                Ok(response)
            },
        )
        .await?;
        Ok((ws, offered))
    }

    async fn accept(&self) -> Result<WsStream, Box<dyn std::error::Error>> {
        Ok(self.accept_with("actioncable-v1-json").await?.0)
    }
}

async fn send_json(ws: &mut WsStream, value: Value) -> TestResult {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await?;
    Ok(())
}

async fn read_json(ws: &mut WsStream) -> Result<Value, Box<dyn std::error::Error>> {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, ws.next())
            .await?
            .ok_or("WebSocket closed unexpectedly")??;
        if let tungstenite::Message::Text(text) = frame {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
}

/// Next envelope with `command`, skipping resent subscribes and the like.
async fn read_command(ws: &mut WsStream, command: &str) -> Result<Value, Box<dyn std::error::Error>> {
    loop {
        let value = read_json(ws).await?;
        if value["command"] == command {
            return Ok(value);
        }
    }
}

/// Wait for the client to close its side.
async fn expect_closed(ws: &mut WsStream) -> TestResult {
    loop {
        match tokio::time::timeout(TIMEOUT, ws.next()).await? {
            None | Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) => return Ok(()),
            Some(Ok(_)) => {}
        }
    }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Result<T, Box<dyn std::error::Error>> {
    Ok(tokio::time::timeout(TIMEOUT, rx.recv())
        .await?
        .ok_or("channel closed")?)
}

// ---------------------------------------------------------------------------
// Test 1: welcome, subscribe, confirm, broadcast, perform
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_subscription_cycle() -> TestResult {
    let server = MockCableServer::start().await?;
    let consumer = create_consumer(Some(server.http_url().as_str()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (connected_tx, received_tx) = (tx.clone(), tx);
    let chat = consumer.subscriptions().create(
        json!({"channel": "ChatChannel", "room": "lobby"}),
        Callbacks::new()
            .on_connected(move |_, info| {
                let _ = connected_tx.send(format!("connected:{}", info.reconnected));
            })
            .on_received(move |_, data| {
                let _ = received_tx.send(data.to_string());
            }),
    )?;

    let (mut ws, offered) = server.accept_with("actioncable-v1-json").await?;
    assert_eq!(
        offered.as_deref(),
        Some("actioncable-v1-json, actioncable-unsupported")
    );

    send_json(&mut ws, json!({"type": "welcome"})).await?;
    let subscribe = read_json(&mut ws).await?;
    assert_eq!(subscribe["command"], "subscribe");
    assert_eq!(
        subscribe["identifier"],
        r#"{"channel":"ChatChannel","room":"lobby"}"#
    );

    send_json(
        &mut ws,
        json!({"type": "confirm_subscription", "identifier": chat.identifier()}),
    )
    .await?;
    assert_eq!(recv(&mut rx).await?, "connected:false");

    send_json(
        &mut ws,
        json!({"identifier": chat.identifier(), "message": {"body": "hello"}}),
    )
    .await?;
    assert_eq!(recv(&mut rx).await?, r#"{"body":"hello"}"#);

    let mut data = Map::new();
    data.insert("body".into(), json!("hi back"));
    chat.perform("speak", data)?;
    let message = read_command(&mut ws, "message").await?;
    assert_eq!(message["command"], "message");
    assert_eq!(message["identifier"], chat.identifier());
    let inner: Value = serde_json::from_str(message["data"].as_str().ok_or("no data")?)?;
    assert_eq!(inner, json!({"action": "speak", "body": "hi back"}));

    assert_eq!(consumer.state().await?, Some(ConnectionState::Open));
    Ok(())
}

// ---------------------------------------------------------------------------
// Test 2: server-requested disconnect without reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_disconnect_without_reconnect() -> TestResult {
    let server = MockCableServer::start().await?;
    let consumer = create_consumer(Some(server.http_url().as_str()))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer.subscriptions().create(
        "chat",
        Callbacks::new().on_disconnected(move |_, info| {
            let _ = tx.send(info.will_attempt_reconnect);
        }),
    )?;

    let mut ws = server.accept().await?;
    send_json(&mut ws, json!({"type": "welcome"})).await?;
    read_json(&mut ws).await?;
    send_json(
        &mut ws,
        json!({"type": "disconnect", "reason": "unauthorized", "reconnect": false}),
    )
    .await?;

    expect_closed(&mut ws).await?;
    assert!(!recv(&mut rx).await?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Test 3: unsupported subprotocol is refused
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsupported_protocol_closes_connection() -> TestResult {
    let server = MockCableServer::start().await?;
    let consumer = create_consumer(Some(server.http_url().as_str()))?;
    assert!(consumer.connect().await?);

    let (mut ws, _) = server.accept_with("actioncable-unsupported").await?;
    expect_closed(&mut ws).await?;

    for _ in 0..50 {
        if consumer.state().await? == Some(ConnectionState::Closed) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err("connection never reported closed".into())
}

// ---------------------------------------------------------------------------
// Test 4: dropping the consumer closes the socket
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropping_consumer_closes_socket() -> TestResult {
    let server = MockCableServer::start().await?;
    let consumer = create_consumer(Some(server.http_url().as_str()))?;
    consumer.connect().await?;
    let mut ws = server.accept().await?;
    send_json(&mut ws, json!({"type": "welcome"})).await?;

    drop(consumer);
    expect_closed(&mut ws).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Test 5: a failed TLS handshake is reported as closed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_tls_handshake_reports_closed() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let consumer = Consumer::new(ConsumerConfig::new(format!(
        "wss://127.0.0.1:{port}/cable"
    )))?;
    assert!(consumer.connect().await?);

    // Plain TCP: hang up on the ClientHello.
    let (tcp, _) = tokio::time::timeout(TIMEOUT, listener.accept()).await??;
    drop(tcp);

    for _ in 0..100 {
        if consumer.state().await? == Some(ConnectionState::Closed) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err("TLS failure never reported closed".into())
}

//! WebSocket transport over tokio-tungstenite.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Once, OnceLock};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::Error;
use crate::transport::{Connector, Transport, TransportEvent, TransportEvents, ready_state};

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

static CRYPTO_PROVIDER: Once = Once::new();

/// rustls needs a process-level crypto provider before the first TLS
/// handshake. An application that installed its own keeps it.
fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Default [`Connector`]: one tokio-tungstenite client per open.
///
/// Each transport is driven by its own task, which must be spawned from
/// inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

enum Outgoing {
    Text(String),
    Close,
}

struct WebSocketTransport {
    state: Arc<AtomicU16>,
    protocol: Arc<OnceLock<String>>,
    out_tx: mpsc::UnboundedSender<Outgoing>,
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        url: &str,
        protocols: &[String],
        events: TransportEvents,
    ) -> Box<dyn Transport> {
        install_crypto_provider();
        let state = Arc::new(AtomicU16::new(ready_state::CONNECTING));
        let protocol = Arc::new(OnceLock::new());
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_socket(
            url.to_string(),
            protocols.to_vec(),
            state.clone(),
            protocol.clone(),
            out_rx,
            events,
        ));

        Box::new(WebSocketTransport {
            state,
            protocol,
            out_tx,
        })
    }
}

impl Transport for WebSocketTransport {
    fn send(&mut self, text: String) -> Result<(), Error> {
        if self.state.load(Ordering::Acquire) != ready_state::OPEN {
            return Err(Error::NotOpen);
        }
        self.out_tx
            .send(Outgoing::Text(text))
            .map_err(|_| Error::NotOpen)
    }

    fn close(&mut self) {
        let current = self.state.load(Ordering::Acquire);
        if current == ready_state::CONNECTING || current == ready_state::OPEN {
            self.state.store(ready_state::CLOSING, Ordering::Release);
            let _ = self.out_tx.send(Outgoing::Close);
        }
    }

    fn ready_state(&self) -> u16 {
        self.state.load(Ordering::Acquire)
    }

    fn protocol(&self) -> Option<String> {
        self.protocol.get().cloned()
    }
}

fn build_request(url: &str, protocols: &[String]) -> Result<Request, Error> {
    let mut request = url.into_client_request()?;
    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| Error::InvalidParams(format!("subprotocol list: {e}")))?;
        request.headers_mut().insert(PROTOCOL_HEADER, value);
    }
    Ok(request)
}

/// Reports the transport closed however the socket task ends, including a
/// panic or the runtime shutting down.
struct CloseOnDrop {
    state: Arc<AtomicU16>,
    events: TransportEvents,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.state.store(ready_state::CLOSED, Ordering::Release);
        self.events.emit(TransportEvent::Close);
    }
}

async fn closed_while_connecting(out_rx: &mut mpsc::UnboundedReceiver<Outgoing>) {
    loop {
        match out_rx.recv().await {
            Some(Outgoing::Close) | None => return,
            Some(Outgoing::Text(_)) => {
                tracing::debug!("Dropping frame queued before open");
            }
        }
    }
}

async fn run_socket(
    url: String,
    protocols: Vec<String>,
    state: Arc<AtomicU16>,
    protocol: Arc<OnceLock<String>>,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
    events: TransportEvents,
) {
    let guard = CloseOnDrop {
        state: state.clone(),
        events,
    };
    let events = &guard.events;

    let request = match build_request(&url, &protocols) {
        Ok(request) => request,
        Err(e) => {
            events.emit(TransportEvent::Error(e.to_string()));
            return;
        }
    };

    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(request) => result,
        _ = closed_while_connecting(&mut out_rx) => {
            tracing::debug!(%url, "Closed before the WebSocket handshake finished");
            return;
        }
    };

    let (ws, response) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(%url, "WebSocket connect failed: {e}");
            events.emit(TransportEvent::Error(e.to_string()));
            return;
        }
    };

    if let Some(selected) = response
        .headers()
        .get(PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        let _ = protocol.set(selected.to_string());
    }
    // close() may have raced the handshake; honour it below rather than here.
    let _ = state.compare_exchange(
        ready_state::CONNECTING,
        ready_state::OPEN,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    events.emit(TransportEvent::Open);

    let (mut ws_write, mut ws_read) = ws.split();
    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if !events.emit(TransportEvent::Message(text.as_str().to_owned())) {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::debug!(?frame, "Server closed the WebSocket");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames carry no cable envelopes
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        events.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                }
            }

            out = out_rx.recv() => {
                match out {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                            tracing::warn!("WebSocket write failed: {e}");
                            events.emit(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        state.store(ready_state::CLOSING, Ordering::Release);
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }
}

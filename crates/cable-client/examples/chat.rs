//! Subscribe to a cable channel and print what it broadcasts.
//!
//! ```sh
//! cargo run -p cable-client --example chat -- <CHANNEL> [ROOM]
//! ```
//!
//! The server URL comes from `ACTION_CABLE_URL` (default
//! `ws://127.0.0.1:3000/cable`). Timing can be tuned with a JSON object in
//! `CABLE_TIMING`, e.g. `{"stale_threshold_ms": 3000}`.
//! Broadcast payloads are printed to stdout (pipe to `jq` for formatting).

use cable_client::{
    Callbacks, ConnectionEvent, Consumer, ConsumerConfig, DEFAULT_URL, TimingConfig, URL_ENV_VAR,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let channel = args.first().ok_or("usage: chat <CHANNEL> [ROOM]")?;
    let params = match args.get(1) {
        Some(room) => json!({"channel": channel, "room": room}),
        None => Value::from(channel.as_str()),
    };

    let url = std::env::var(URL_ENV_VAR).unwrap_or_else(|_| DEFAULT_URL.to_string());
    let mut config = ConsumerConfig::new(url);
    if let Ok(timing) = std::env::var("CABLE_TIMING") {
        config.timing = serde_json::from_str::<TimingConfig>(&timing)?;
    }
    let consumer = Consumer::new(config)?;
    let mut events = consumer.events();

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let subscription = consumer.subscriptions().create(
        params,
        Callbacks::new()
            .on_connected(|s, info| {
                eprintln!("[subscribed] {} reconnected={}", s.identifier(), info.reconnected);
            })
            .on_disconnected(|_, info| {
                eprintln!("[disconnected] will_reconnect={}", info.will_attempt_reconnect);
            })
            .on_rejected(|s| eprintln!("[rejected] {}", s.identifier()))
            .on_received(move |_, data| {
                let _ = tx.send(data);
            }),
    )?;
    eprintln!("subscribing to {} ...", subscription.identifier());

    loop {
        tokio::select! {
            Some(data) = rx.recv() => println!("{data}"),
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected { reconnected }) => {
                    eprintln!("[welcome] reconnected={reconnected}");
                }
                Ok(ConnectionEvent::ServerDisconnect { reason, reconnect }) => {
                    eprintln!("[server disconnect] reason={reason:?} reconnect={reconnect}");
                    if !reconnect {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("[lagged] skipped {n} connection events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

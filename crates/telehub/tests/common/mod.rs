//! Test utilities and common setup.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use telehub::api::{self, AppState};
use telehub::config::AppConfig;
use telehub::error::SerialError;
use telehub::router::MessageRouter;
use telehub::serial::{HardwareCommand, LinkState, PortOpener};
use telehub::ws::{BroadcastHub, ClientRegistry};
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A hub wired up without a serial monitor. Commands land in `commands`.
pub struct TestHub {
    pub app: Router,
    pub state: AppState,
    pub commands: mpsc::Receiver<HardwareCommand>,
    pub link: watch::Sender<LinkState>,
}

pub fn test_hub() -> TestHub {
    test_hub_with_config(&AppConfig::default())
}

pub fn test_hub_with_config(config: &AppConfig) -> TestHub {
    let registry = Arc::new(ClientRegistry::new());
    let hub = BroadcastHub::new(registry, config.hub.overflow_policy);
    let (tx, commands) = mpsc::channel(config.serial.command_queue);
    let router = MessageRouter::new(hub, tx);
    let (link, link_rx) = watch::channel(LinkState::Disconnected);

    let state = AppState::new(router, link_rx, config);
    TestHub {
        app: api::create_router(state.clone()),
        state,
        commands,
        link,
    }
}

/// Serve `app` on an ephemeral local port.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
pub async fn next_json(ws: &mut WsClient) -> Value {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).unwrap();
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("unexpected websocket event: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Connect and consume the registration frame. Returns the assigned id.
pub async fn connect_registered(addr: SocketAddr) -> (WsClient, u64) {
    let mut ws = connect(addr).await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "register");
    let id = frame["clientid"].as_u64().unwrap();
    (ws, id)
}

/// Poll until `check` holds or the timeout expires.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Hands out in-memory streams in order, then fails every later open.
pub struct DuplexOpener(pub VecDeque<DuplexStream>);

impl DuplexOpener {
    pub fn new(streams: impl IntoIterator<Item = DuplexStream>) -> Self {
        Self(streams.into_iter().collect())
    }
}

impl PortOpener for DuplexOpener {
    type Port = DuplexStream;

    fn open(&mut self) -> Result<DuplexStream, SerialError> {
        self.0.pop_front().ok_or(SerialError::NotConnected)
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}

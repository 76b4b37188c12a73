//! Shared helpers: an in-process gateway and scriptable upstream relays.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use nostr_multiplexer::{GatewayConfig, GatewayServer, telemetry};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, sleep, timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async, tungstenite::Message,
};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a gateway on an ephemeral port and return its address.
pub async fn start_gateway() -> SocketAddr {
    telemetry::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = GatewayConfig::default().with_bind_addr(addr);

    tokio::spawn(async move {
        let server = GatewayServer::new(config);
        let _ = server.serve(listener).await;
    });

    addr
}

pub async fn connect_client(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    ws
}

pub async fn send(client: &mut Client, frame: Value) {
    client.send(Message::text(frame.to_string())).await.unwrap();
}

pub async fn send_raw(client: &mut Client, frame: &str) {
    client.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next text frame as JSON, or `None` once the gateway closes the socket.
pub async fn next_frame(client: &mut Client) -> Option<Value> {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for gateway");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap());
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// How a mock relay answers
#[derive(Clone, Default)]
pub struct RelayScript {
    /// Stored events sent in reply to every REQ, before EOSE
    pub events: Vec<Value>,
    /// Answer EVENT/AUTH with OK
    pub acknowledge: bool,
    /// Reply to COUNT with this count
    pub count: u64,
}

/// Upstream relay that follows a [`RelayScript`] and records what it receives.
pub struct MockRelay {
    pub url: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockRelay {
    pub async fn start(script: RelayScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_relay(stream, script.clone(), Arc::clone(&log)));
            }
        });

        Self { url, received }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Wait until a frame with this verb has arrived.
    pub async fn wait_for(&self, verb: &str) -> Value {
        for _ in 0..100 {
            if let Some(frame) = self.received().into_iter().find(|f| f[0] == verb) {
                return frame;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("relay {} never received {}", self.url, verb);
    }
}

async fn serve_relay(stream: TcpStream, script: RelayScript, log: Arc<Mutex<Vec<Value>>>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        log.lock().push(frame.clone());

        let mut replies = Vec::new();
        match frame[0].as_str() {
            Some("REQ") => {
                let sub_id = frame[1].clone();
                for event in &script.events {
                    replies.push(json!(["EVENT", sub_id, event]));
                }
                replies.push(json!(["EOSE", sub_id]));
            }
            Some("COUNT") => replies.push(json!(["COUNT", frame[1], {"count": script.count}])),
            Some("EVENT") | Some("AUTH") if script.acknowledge => {
                replies.push(json!(["OK", frame[1]["id"], true, ""]));
            }
            _ => {}
        }

        for reply in replies {
            if ws.send(Message::text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

/// A one-relay envelope
pub fn envelope(relays: &[&str], message: Value) -> Value {
    json!([{ "relays": relays }, message])
}

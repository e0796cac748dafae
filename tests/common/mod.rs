//! Fake local RPC host for integration tests.
//!
//! Speaks just enough of the protocol to drive the engine: sends `READY`,
//! answers `AUTHORIZE` with a code, accepts or rejects `AUTHENTICATE`
//! depending on the token, and acknowledges `SET_ACTIVITY`. Every inbound
//! frame is recorded so tests can assert on what the engine sent.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rpc_presence::{EngineSettings, EndpointSettings};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// How the host answers `AUTHORIZE`.
#[derive(Debug, Clone)]
pub enum AuthorizeReply {
    /// Respond with this code.
    Code(String),
    /// Respond with an `ERROR` frame carrying this message.
    Reject(String),
    /// Send a nonce-less `ERROR` dispatch instead of a response.
    UnsolicitedError(String),
    /// Never answer.
    Ignore,
}

/// Scripted host behaviour.
#[derive(Debug, Clone)]
pub struct HostBehavior {
    /// Send `DISPATCH/READY` on connect.
    pub send_ready: bool,
    /// Close with this code right after the upgrade.
    pub close_on_connect: Option<u16>,
    pub authorize: AuthorizeReply,
    /// Tokens `AUTHENTICATE` accepts.
    pub accepted_tokens: Vec<String>,
    /// Answer every `SET_ACTIVITY` with an `ERROR` carrying this message.
    pub reject_activity: Option<String>,
}

impl Default for HostBehavior {
    fn default() -> Self {
        Self {
            send_ready: true,
            close_on_connect: None,
            authorize: AuthorizeReply::Code("auth-code".into()),
            accepted_tokens: vec!["auth-code".into()],
            reject_activity: None,
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    frames: Mutex<Vec<Value>>,
    connections: AtomicUsize,
}

/// A running fake host bound to an ephemeral loopback port.
#[derive(Debug)]
pub struct FakeHost {
    port: u16,
    recorded: Arc<Recorded>,
    close_tx: broadcast::Sender<(u16, String)>,
    task: JoinHandle<()>,
}

impl FakeHost {
    pub async fn start(behavior: HostBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let recorded = Arc::new(Recorded::default());
        let (close_tx, _) = broadcast::channel(8);

        let task = {
            let recorded = Arc::clone(&recorded);
            let close_tx = close_tx.clone();
            tokio::spawn(async move {
                while let Ok((stream, _addr)) = listener.accept().await {
                    let behavior = behavior.clone();
                    let recorded = Arc::clone(&recorded);
                    let close_rx = close_tx.subscribe();
                    tokio::spawn(handle_connection(stream, behavior, recorded, close_rx));
                }
            })
        };

        Self {
            port,
            recorded,
            close_tx,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of completed WebSocket upgrades.
    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    /// Every frame received so far.
    pub fn frames(&self) -> Vec<Value> {
        self.recorded.frames.lock().unwrap().clone()
    }

    /// Frames received for one command.
    pub fn commands(&self, cmd: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["cmd"] == cmd)
            .collect()
    }

    /// Close every open connection with `code`.
    pub fn close_all(&self, code: u16, reason: &str) {
        let _ = self.close_tx.send((code, reason.to_string()));
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    behavior: HostBehavior,
    recorded: Arc<Recorded>,
    mut close_rx: broadcast::Receiver<(u16, String)>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    recorded.connections.fetch_add(1, Ordering::SeqCst);

    if let Some(code) = behavior.close_on_connect {
        let _ = ws.send(close_message(code, "Invalid Origin")).await;
        return;
    }

    if behavior.send_ready {
        let ready = json!({
            "cmd": "DISPATCH",
            "evt": "READY",
            "data": {"v": 1, "user": {"id": "1", "username": "tester"}}
        });
        let _ = ws.send(Message::Text(ready.to_string())).await;
    }

    loop {
        tokio::select! {
            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                recorded.frames.lock().unwrap().push(frame.clone());
                if let Some(reply) = respond(&behavior, &frame) {
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            close = close_rx.recv() => {
                if let Ok((code, reason)) = close {
                    let _ = ws.send(close_message(code, &reason)).await;
                    // Drain until the client acknowledges the close.
                    let _ = tokio::time::timeout(Duration::from_secs(1), async {
                        while let Some(Ok(_)) = ws.next().await {}
                    })
                    .await;
                }
                break;
            }
        }
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason.to_string()),
    }))
}

fn error_reply(cmd: &str, nonce: &Value, message: &str) -> Value {
    json!({
        "cmd": cmd,
        "evt": "ERROR",
        "nonce": nonce,
        "data": {"code": 4000, "message": message}
    })
}

fn authorize_reply(cmd: &str, nonce: &Value, reply: &AuthorizeReply) -> Option<Value> {
    match reply {
        AuthorizeReply::Code(code) => Some(json!({
            "cmd": "AUTHORIZE",
            "nonce": nonce,
            "data": {"code": code}
        })),
        AuthorizeReply::Reject(message) => Some(error_reply(cmd, nonce, message)),
        AuthorizeReply::UnsolicitedError(message) => Some(json!({
            "cmd": "DISPATCH",
            "evt": "ERROR",
            "data": {"code": 4000, "message": message}
        })),
        AuthorizeReply::Ignore => None,
    }
}

fn respond(behavior: &HostBehavior, frame: &Value) -> Option<Value> {
    let nonce = &frame["nonce"];
    let cmd = frame["cmd"].as_str()?;
    match cmd {
        "AUTHORIZE" => authorize_reply(cmd, nonce, &behavior.authorize),
        "AUTHENTICATE" => {
            let token = frame["args"]["access_token"].as_str().unwrap_or_default();
            if behavior.accepted_tokens.iter().any(|t| t == token) {
                Some(json!({
                    "cmd": "AUTHENTICATE",
                    "nonce": nonce,
                    "data": {"access_token": token, "application": {"id": "42"}}
                }))
            } else {
                Some(error_reply(cmd, nonce, "Invalid access token"))
            }
        }
        "SET_ACTIVITY" => Some(match &behavior.reject_activity {
            Some(message) => error_reply(cmd, nonce, message),
            None => json!({
                "cmd": "SET_ACTIVITY",
                "nonce": nonce,
                "data": frame["args"]["activity"]
            }),
        }),
        _ => None,
    }
}

/// Engine settings pointed at `ports`, with test-sized timings.
pub fn settings(ports: Vec<u16>) -> EngineSettings {
    EngineSettings {
        endpoint: EndpointSettings {
            ports,
            probe_timeout: Duration::from_secs(1),
            ..EndpointSettings::default()
        },
        command_timeout: Duration::from_secs(2),
        refresh_interval: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(200),
        companion_url: None,
    }
}

/// A loopback port with nothing listening.
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

//! Loopback WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. The rest of the crate never touches tungstenite
//! types directly.
//!
//! [`connect`] builds the request (URL plus optional headers such as
//! `Origin`) and performs the upgrade. It returns a ([`WsWriter`],
//! [`WsReader`]) pair that the transport layer drives from two tasks.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::constants::{RPC_ENCODING, RPC_VERSION};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame (the RPC endpoint never sends these).
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1005 when the peer sent none).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a normal close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Pongs and raw frames are skipped.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => return Some(Ok(WsMessage::Text(text))),
                Ok(tungstenite::Message::Binary(data)) => {
                    return Some(Ok(WsMessage::Binary(data)));
                }
                Ok(tungstenite::Message::Ping(data)) => return Some(Ok(WsMessage::Ping(data))),
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map_or((1005, String::new()), |cf| {
                            (cf.code.into(), cf.reason.to_string())
                        });
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_)) => {}
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            }
        }
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// # Errors
///
/// Returns an error if the URL is invalid, a header is malformed, or the
/// upgrade fails (refused port, non-WebSocket listener).
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Build the RPC endpoint URL for one candidate port.
///
/// The host reads the protocol version, the application id and the encoding
/// from the query string.
#[must_use]
pub fn endpoint_url(host: &str, port: u16, client_id: &str) -> String {
    format!("ws://{host}:{port}/?v={RPC_VERSION}&client_id={client_id}&encoding={RPC_ENCODING}")
}

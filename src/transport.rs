//! Transport connection: one duplex socket, framed as JSON [`Frame`]s.
//!
//! # Architecture
//!
//! ```text
//!   FrameSender ──mpsc──► writer task ──► WsWriter
//!                                               │ socket
//!   FrameHandler ◄────── reader task ◄── WsReader
//!   (on_frame / on_close / on_error)
//! ```
//!
//! The connection performs framing only. Protocol meaning lives in the
//! handler the caller installs (the correlator router). Outbound frames are
//! queued on an unbounded channel so sends never block and keep FIFO order.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{PresenceError, PresenceResult};
use crate::frame::Frame;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Callbacks invoked by the reader task.
///
/// Implementations must be cheap and non-blocking; they run on the socket
/// reader task.
pub trait FrameHandler: Send + Sync + 'static {
    /// A decoded inbound frame.
    fn on_frame(&self, frame: Frame);
    /// The peer closed the socket (or the stream ended).
    fn on_close(&self, code: u16, reason: String);
    /// A read error terminated the socket.
    fn on_error(&self, error: String);
}

/// Item queued for the writer task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Text(String),
    Close,
}

#[cfg(test)]
impl Outgoing {
    /// Decode a queued text frame.
    pub(crate) fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Text(text) => Frame::decode(&text).ok(),
            _ => None,
        }
    }
}

/// Cloneable handle for sending frames on a connection.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl FrameSender {
    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// `NotConnected` when the writer task has exited.
    pub fn send(&self, frame: &Frame) -> PresenceResult<()> {
        let text = frame
            .encode()
            .map_err(|e| PresenceError::Transport(format!("encode failed: {e}")))?;
        log::trace!("[Transport] -> {}", text);
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_closed| PresenceError::NotConnected)
    }

    /// Sender paired with the raw outgoing queue, for unit tests.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// One open socket to the RPC endpoint.
#[derive(Debug)]
pub struct Connection {
    port: u16,
    sender: FrameSender,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Open a socket to `url` and start the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// `Transport` when the connect or upgrade fails.
    pub async fn open(
        url: &str,
        port: u16,
        headers: &[(&str, &str)],
        handler: Arc<dyn FrameHandler>,
    ) -> PresenceResult<Self> {
        let (writer, reader) = ws::connect(url, headers)
            .await
            .map_err(|e| PresenceError::Transport(format!("{e:#}")))?;

        log::debug!("[Transport] Socket open on port {}", port);

        let (tx, rx) = mpsc::unbounded_channel();
        let sender = FrameSender { tx };
        let reader = tokio::spawn(run_reader(reader, handler));
        let writer = tokio::spawn(run_writer(writer, rx));

        Ok(Self {
            port,
            sender,
            reader,
            writer,
        })
    }

    /// Port this connection is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Handle for queueing frames.
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Queue a frame on this connection.
    pub fn send(&self, frame: &Frame) -> PresenceResult<()> {
        self.sender.send(frame)
    }

    /// Flush queued frames, send a close frame and stop both tasks.
    ///
    /// The reader is stopped first so no close callback fires for a
    /// locally initiated close.
    pub async fn close(mut self) {
        self.reader.abort();
        let _ = self.sender.tx.send(Outgoing::Close);
        if tokio::time::timeout(std::time::Duration::from_secs(1), &mut self.writer)
            .await
            .is_err()
        {
            log::debug!("[Transport] Writer did not finish closing port {}", self.port);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn run_writer(mut writer: WsWriter, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outgoing::Text(text) => {
                if let Err(e) = writer.send_text(text).await {
                    log::warn!("[Transport] {:#}", e);
                    return;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.close().await;
}

async fn run_reader(mut reader: WsReader, handler: Arc<dyn FrameHandler>) {
    while let Some(message) = reader.recv().await {
        match message {
            Ok(WsMessage::Text(text)) => match Frame::decode(&text) {
                Ok(frame) => {
                    log::trace!("[Transport] <- {}", frame.label());
                    handler.on_frame(frame);
                }
                Err(e) => {
                    log::warn!(
                        "[Transport] Dropping undecodable frame ({}): {}",
                        e,
                        text.chars().take(100).collect::<String>()
                    );
                }
            },
            Ok(WsMessage::Ping(_)) => {
                // tungstenite queues the pong itself and flushes it on the next read or write.
                log::trace!("[Transport] <- ping");
            }
            Ok(WsMessage::Binary(_)) => {
                log::debug!("[Transport] Ignoring binary frame");
            }
            Ok(WsMessage::Close { code, reason }) => {
                handler.on_close(code, reason);
                return;
            }
            Err(e) => {
                handler.on_error(format!("{e:#}"));
                return;
            }
        }
    }
    handler.on_close(1006, "stream ended".to_string());
}

//! Request/response correlation over one duplex connection.
//!
//! Every outbound command gets a nonce and a [`PendingCommand`] entry. The
//! socket reader hands each inbound frame to [`Correlator::route`]: a frame
//! whose nonce is pending completes that entry, anything else is an
//! unsolicited event and goes back to the caller.
//!
//! # Removal paths
//!
//! An entry leaves the table exactly once, through one of:
//!
//! - a matching response (resolve) or `ERROR` frame (reject), in `route`;
//! - its deadline passing, in [`Ticket::wait`];
//! - [`Correlator::cancel_all`] on teardown or link loss.
//!
//! All three remove under the table lock, so whichever path removes the
//! entry owns its completion and the others see nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::constants::ID_PREFIX;
use crate::error::{PresenceError, PresenceResult};
use crate::frame::Frame;
use crate::transport::{FrameHandler, FrameSender};

type Completion = oneshot::Sender<PresenceResult<Frame>>;

/// An outstanding command awaiting its response.
#[derive(Debug)]
pub struct PendingCommand {
    /// Command name, for timeout errors and logs.
    pub cmd: String,
    /// When the command was registered.
    pub issued_at: Instant,
    completion: Completion,
}

#[derive(Debug, Default)]
struct Table {
    pending: HashMap<String, PendingCommand>,
    counter: u64,
}

/// Shared pending-command table plus nonce generator.
///
/// Cloning is cheap; clones share the same table. The table is the only
/// state touched from the socket reader task.
#[derive(Debug, Clone)]
pub struct Correlator {
    table: Arc<Mutex<Table>>,
    window: Duration,
}

impl Correlator {
    /// Create a correlator whose commands expire after `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate the next nonce.
    ///
    /// A monotonic counter keeps nonces unique for the lifetime of the
    /// correlator; the timestamp keeps them distinct across sessions.
    pub fn next_nonce(&self) -> String {
        let mut table = self.lock();
        table.counter += 1;
        format!(
            "{}_{}_{}",
            ID_PREFIX,
            table.counter,
            chrono::Utc::now().timestamp_millis()
        )
    }

    /// Register a command and queue it on `sender`.
    ///
    /// The entry is registered before the frame is queued so a fast response
    /// always finds it.
    ///
    /// # Errors
    ///
    /// `NotConnected` if the frame cannot be queued; the entry is removed.
    pub fn dispatch(&self, sender: &FrameSender, cmd: &str, args: Value) -> PresenceResult<Ticket> {
        let nonce = self.next_nonce();
        let (completion, rx) = oneshot::channel();
        let issued_at = Instant::now();

        self.lock().pending.insert(
            nonce.clone(),
            PendingCommand {
                cmd: cmd.to_string(),
                issued_at,
                completion,
            },
        );

        let frame = Frame::command(cmd, nonce.clone(), args);
        if let Err(e) = sender.send(&frame) {
            self.lock().pending.remove(&nonce);
            return Err(e);
        }
        log::debug!("[Correlator] Issued {} ({})", cmd, nonce);

        Ok(Ticket {
            nonce,
            cmd: cmd.to_string(),
            deadline: issued_at + self.window,
            rx,
            table: Arc::clone(&self.table),
        })
    }

    /// Issue a command and wait for its response.
    ///
    /// # Errors
    ///
    /// `Rpc` for an error frame, `CommandTimeout` when the window elapses,
    /// `Cancelled` if the session closes first.
    pub async fn issue(&self, sender: &FrameSender, cmd: &str, args: Value) -> PresenceResult<Frame> {
        self.dispatch(sender, cmd, args)?.wait().await
    }

    /// Match an inbound frame against the pending table.
    ///
    /// Returns `None` when the frame completed a pending command, or the
    /// frame itself when it is unsolicited (no nonce, or an unknown one).
    pub fn route(&self, frame: Frame) -> Option<Frame> {
        let entry = match frame.nonce.as_deref() {
            Some(nonce) => self.lock().pending.remove(nonce),
            None => None,
        };

        let Some(entry) = entry else {
            return Some(frame);
        };

        let result = if frame.is_error() {
            log::debug!("[Correlator] {} rejected: {}", entry.cmd, frame.error_message());
            Err(PresenceError::Rpc(frame.error_message()))
        } else {
            log::debug!(
                "[Correlator] {} resolved after {:?}",
                entry.cmd,
                entry.issued_at.elapsed()
            );
            Ok(frame)
        };
        // The waiter may have given up already; nothing else to do then.
        let _ = entry.completion.send(result);
        None
    }

    /// Reject every pending command with `Cancelled`.
    ///
    /// Returns how many entries were removed.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingCommand> = self.lock().pending.drain().map(|(_, v)| v).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.completion.send(Err(PresenceError::Cancelled));
        }
        if count > 0 {
            log::debug!("[Correlator] Cancelled {} pending command(s)", count);
        }
        count
    }

    /// Number of commands awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether `nonce` is still awaiting a response.
    pub fn is_pending(&self, nonce: &str) -> bool {
        self.lock().pending.contains_key(nonce)
    }
}

/// Awaitable result of one dispatched command.
#[derive(Debug)]
pub struct Ticket {
    nonce: String,
    cmd: String,
    deadline: Instant,
    rx: oneshot::Receiver<PresenceResult<Frame>>,
    table: Arc<Mutex<Table>>,
}

impl Ticket {
    /// Nonce the command was sent with.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Wait for the response or the deadline.
    pub async fn wait(mut self) -> PresenceResult<Frame> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(PresenceError::Cancelled),
            Err(_elapsed) => {
                let removed = self
                    .table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pending
                    .remove(&self.nonce);
                if removed.is_some() {
                    log::warn!("[Correlator] {} timed out ({})", self.cmd, self.nonce);
                    return Err(PresenceError::CommandTimeout(self.cmd));
                }
                // Another removal path won the race; its result is already queued.
                self.rx.await.unwrap_or(Err(PresenceError::Cancelled))
            }
        }
    }
}

/// Event forwarded from the socket to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Unsolicited frame (dispatch, or a response nobody waits for).
    Dispatch(Frame),
    /// The peer closed the socket.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The socket failed.
    Failed(String),
}

/// [`FrameHandler`] that routes responses into the correlator and forwards
/// everything else as [`LinkEvent`]s.
#[derive(Debug)]
pub struct Router {
    correlator: Correlator,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Router {
    /// Create a router and the receiver its events arrive on.
    pub fn channel(correlator: Correlator) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { correlator, events }), rx)
    }
}

impl FrameHandler for Router {
    fn on_frame(&self, frame: Frame) {
        if let Some(unsolicited) = self.correlator.route(frame) {
            let _ = self.events.send(LinkEvent::Dispatch(unsolicited));
        }
    }

    fn on_close(&self, code: u16, reason: String) {
        let _ = self.events.send(LinkEvent::Closed { code, reason });
    }

    fn on_error(&self, error: String) {
        let _ = self.events.send(LinkEvent::Failed(error));
    }
}

//! Session connection state and the events reported upward.
//!
//! [`ConnectionState`] moves strictly forward through the handshake
//! (`Disconnected → Connecting → AwaitingReady → Authorizing →
//! Authenticating → Connected`). `Disconnected` is reachable from anywhere.
//! The one backward edge is `AwaitingReady → Connecting`, taken when the
//! locator gives up on a port and moves to the next candidate.
//!
//! [`StateCell`] is the single place the state is written. It publishes the
//! current value on a `watch` channel and every change as a
//! [`SessionEvent::StateChanged`] on a broadcast channel.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::error::PresenceError;

/// Capacity of the session event broadcast.
pub const EVENT_CAPACITY: usize = 64;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Scanning ports.
    Connecting,
    /// Socket open, waiting for the host's ready dispatch.
    AwaitingReady,
    /// `AUTHORIZE` in flight.
    Authorizing,
    /// `AUTHENTICATE` in flight (possibly via the token exchange).
    Authenticating,
    /// Authenticated; activity is published and kept alive.
    Connected,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal edge.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, AwaitingReady)
                | (AwaitingReady, Connecting)
                | (AwaitingReady, Authorizing)
                | (Authorizing, Authenticating)
                | (Authenticating, Connected)
        )
    }

    /// `true` while a handshake is under way.
    #[must_use]
    pub fn is_handshaking(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingReady => "awaiting_ready",
            Self::Authorizing => "authorizing",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Notifications delivered to `PresenceClient::subscribe` receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// Something failed; the display text is suitable for a status line.
    Error(PresenceError),
    /// `SET_ACTIVITY` was acknowledged.
    ActivityPublished,
    /// A reconnection attempt was scheduled.
    ReconnectScheduled {
        /// Delay before the attempt, in milliseconds.
        delay_ms: u64,
    },
}

/// Shared writer for the session state.
///
/// Cloned into the in-flight handshake so it can advance the state while the
/// session task polls it.
#[derive(Debug, Clone)]
pub struct StateCell {
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl StateCell {
    /// Create a cell starting at `Disconnected`.
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(state),
            events,
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state value.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receiver for session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Move to `next` if the edge is legal.
    ///
    /// Returns `true` when the state changed. Self-transitions are no-ops;
    /// illegal edges are logged and ignored.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let current = self.get();
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            log::warn!("[Session] Ignoring illegal transition {} -> {}", current, next);
            return false;
        }
        self.state.send_replace(next);
        log::debug!("[Session] {} -> {}", current, next);
        self.emit(SessionEvent::StateChanged {
            from: current,
            to: next,
        });
        true
    }

    /// Report an error upward.
    pub fn report(&self, error: PresenceError) {
        log::warn!("[Session] {}", error);
        self.emit(SessionEvent::Error(error));
    }

    /// Broadcast an event. Having no subscribers is fine.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_forward_handshake_path_is_legal() {
        let path = [
            Disconnected,
            Connecting,
            AwaitingReady,
            Authorizing,
            Authenticating,
            Connected,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_disconnected_reachable_from_everywhere() {
        for state in [Connecting, AwaitingReady, Authorizing, Authenticating, Connected] {
            assert!(state.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn test_skipping_steps_is_illegal() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Authorizing));
        assert!(!Authorizing.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Authenticating.can_transition_to(Authorizing));
    }

    #[test]
    fn test_next_port_edge_is_legal() {
        assert!(AwaitingReady.can_transition_to(Connecting));
    }

    #[tokio::test]
    async fn test_cell_emits_changes_and_ignores_illegal_edges() {
        let cell = StateCell::new();
        let mut events = cell.subscribe();

        assert!(cell.transition(Connecting));
        assert!(!cell.transition(Connecting));
        assert!(!cell.transition(Connected));
        assert_eq!(cell.get(), Connecting);

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged {
                from: Disconnected,
                to: Connecting
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_watch_observes_latest_state() {
        let cell = StateCell::new();
        let rx = cell.watch();
        cell.transition(Connecting);
        cell.transition(AwaitingReady);
        assert_eq!(*rx.borrow(), AwaitingReady);
    }

    #[test]
    fn test_display_labels() {
        assert_eq!(AwaitingReady.to_string(), "awaiting_ready");
        assert_eq!(Connected.to_string(), "connected");
        assert!(Authorizing.is_handshaking());
        assert!(!Connected.is_handshaking());
    }
}

//! Engine error taxonomy.
//!
//! Every failure the engine reports upward is a [`PresenceError`]. The
//! `Display` text is meant for direct display in a UI status line.

use thiserror::Error;

/// Errors produced by the presence engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// No port in the candidate range completed a handshake.
    #[error("no compatible local endpoint running; make sure the chat client is open")]
    EndpointNotFound,

    /// The ready signal or a handshake step did not arrive in time.
    #[error("handshake timed out while waiting for {0}")]
    HandshakeTimeout(String),

    /// The host refused the `AUTHORIZE` request.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// `AUTHENTICATE` failed, including the token-exchange fallback.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A correlated command received no response within its window.
    #[error("command timed out: {0}")]
    CommandTimeout(String),

    /// `SET_ACTIVITY` was rejected or timed out.
    #[error("failed to set activity: {0}")]
    ActivityPublishFailed(String),

    /// The host closed the socket with the origin-rejected code.
    #[error("connection rejected by the chat client (invalid origin)")]
    OriginRejected,

    /// An error frame answered a correlated command.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The socket closed underneath an operation.
    #[error("connection closed (code {code}: {reason})")]
    ConnectionClosed {
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },

    /// Socket level failure (connect, read, write).
    #[error("transport error: {0}")]
    Transport(String),

    /// The fallback token exchange failed.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The operation was abandoned because the session closed.
    #[error("cancelled: session closed")]
    Cancelled,

    /// A command needed a live connection and there was none.
    #[error("not connected")]
    NotConnected,
}

impl PresenceError {
    /// Returns `true` when the supervisor may schedule an automatic retry.
    ///
    /// `EndpointNotFound` means the host is not running, so retrying is left
    /// to the caller. `OriginRejected` is fatal for this client.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::EndpointNotFound | Self::OriginRejected | Self::Cancelled
        )
    }
}

/// Convenience alias used across the engine.
pub type PresenceResult<T> = std::result::Result<T, PresenceError>;

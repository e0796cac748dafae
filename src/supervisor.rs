//! Reconnection policy and the single reconnect timer.
//!
//! The supervisor decides whether a lost or failed session should be retried
//! and owns the one timer that triggers the retry. It never connects by
//! itself: the session task polls [`Supervisor::wait`] and starts a new
//! attempt when it fires, provided a configuration is still desired.

use std::future;
use std::time::Duration;

use tokio::time::Instant;

use crate::constants::{CLOSE_ORIGIN_REJECTED, RECONNECT_DELAY};
use crate::error::PresenceError;

/// Why a session left the connected (or connecting) path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The socket of a live session closed or failed.
    LinkLost {
        /// Close code (1006 when the socket errored).
        code: u16,
        /// Close reason or error text.
        reason: String,
    },
    /// A handshake attempt failed.
    HandshakeFailed(PresenceError),
    /// The owner asked to disconnect.
    Explicit,
}

impl DisconnectCause {
    /// Whether this cause permits an automatic retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LinkLost { code, .. } => *code != CLOSE_ORIGIN_REJECTED,
            Self::HandshakeFailed(e) => e.is_retryable(),
            Self::Explicit => false,
        }
    }
}

/// Fixed-delay reconnect scheduler with at most one pending timer.
#[derive(Debug)]
pub struct Supervisor {
    delay: Duration,
    deadline: Option<Instant>,
    scheduled: u64,
}

impl Supervisor {
    /// Create a supervisor that retries after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            scheduled: 0,
        }
    }

    /// Retry delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// React to a disconnect.
    ///
    /// Schedules a retry when `desired` is set and the cause allows it.
    /// Returns `true` if a new timer was armed.
    pub fn on_disconnect(&mut self, cause: &DisconnectCause, desired: bool) -> bool {
        if !desired || !cause.is_retryable() {
            log::debug!("[Supervisor] Not retrying after {:?}", cause);
            return false;
        }
        self.schedule()
    }

    /// Arm the timer unless one is already pending.
    pub fn schedule(&mut self) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(Instant::now() + self.delay);
        self.scheduled += 1;
        log::info!("[Supervisor] Reconnecting in {:?}", self.delay);
        true
    }

    /// Drop any pending timer.
    pub fn cancel(&mut self) {
        if self.deadline.take().is_some() {
            log::debug!("[Supervisor] Reconnect cancelled");
        }
    }

    /// Whether a timer is armed.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Total timers armed since creation.
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled
    }

    /// Resolves when the pending timer expires; never resolves when idle.
    ///
    /// Does not disarm the timer; call [`Supervisor::fire`] afterwards.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    }

    /// Disarm an expired timer. Returns `false` if none was pending.
    pub fn fire(&mut self) -> bool {
        self.deadline.take().is_some()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(RECONNECT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost(code: u16) -> DisconnectCause {
        DisconnectCause::LinkLost {
            code,
            reason: String::new(),
        }
    }

    #[test]
    fn test_origin_rejected_close_never_retries() {
        let mut supervisor = Supervisor::default();
        assert!(!supervisor.on_disconnect(&lost(4001), true));
        assert!(!supervisor.is_pending());
    }

    #[test]
    fn test_link_loss_retries_only_while_desired() {
        let mut supervisor = Supervisor::default();
        assert!(!supervisor.on_disconnect(&lost(1006), false));
        assert!(supervisor.on_disconnect(&lost(1006), true));
        assert!(supervisor.is_pending());
    }

    #[test]
    fn test_handshake_failure_classification() {
        assert!(DisconnectCause::HandshakeFailed(PresenceError::AuthenticationFailed("x".into())).is_retryable());
        assert!(DisconnectCause::HandshakeFailed(PresenceError::HandshakeTimeout("READY".into())).is_retryable());
        assert!(!DisconnectCause::HandshakeFailed(PresenceError::EndpointNotFound).is_retryable());
        assert!(!DisconnectCause::HandshakeFailed(PresenceError::OriginRejected).is_retryable());
        assert!(!DisconnectCause::Explicit.is_retryable());
    }

    #[test]
    fn test_only_one_timer_outstanding() {
        let mut supervisor = Supervisor::default();
        assert!(supervisor.schedule());
        assert!(!supervisor.schedule());
        assert!(!supervisor.on_disconnect(&lost(1000), true));
        assert_eq!(supervisor.scheduled_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let mut supervisor = Supervisor::new(Duration::from_secs(5));
        let started = Instant::now();
        supervisor.schedule();

        supervisor.wait().await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(supervisor.fire());
        assert!(!supervisor.fire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_wait_never_resolves() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let result = tokio::time::timeout(Duration::from_secs(60), supervisor.wait()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_cancel_clears_pending_timer() {
        let mut supervisor = Supervisor::default();
        supervisor.schedule();
        supervisor.cancel();
        assert!(!supervisor.is_pending());
        assert!(supervisor.schedule());
    }
}

//! Protocol and timing constants for the presence engine.
//!
//! This module centralizes the magic numbers of the local RPC protocol so the
//! engine, the config layer and the tests agree on defaults. Constants are
//! grouped by domain.
//!
//! # Categories
//!
//! - **Endpoint**: where the host application listens
//! - **Timeouts**: probe and command windows
//! - **Intervals**: keep-alive and reconnection pacing
//! - **Protocol**: wire literals and close codes

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Endpoint
// ============================================================================

/// Loopback host the chat client binds its RPC endpoint to.
pub const RPC_HOST: &str = "127.0.0.1";

/// First port of the candidate range.
pub const RPC_PORT_START: u16 = 6463;

/// Number of contiguous candidate ports (6463..=6472).
pub const RPC_PORT_COUNT: u16 = 10;

/// Protocol version embedded in the connection URL.
pub const RPC_VERSION: u32 = 1;

/// Encoding tag embedded in the connection URL.
pub const RPC_ENCODING: &str = "json";

// ============================================================================
// Timeouts
// ============================================================================

/// Absolute budget for one port probe.
///
/// Covers the TCP connect, the WebSocket upgrade and the wait for the
/// `READY` dispatch. A full scan is bounded by ten of these.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a correlated command may wait for its response.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP request timeout for the companion service.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an explicit disconnect waits for the activity clear to be
/// acknowledged before closing the socket anyway.
pub const CLEAR_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Intervals
// ============================================================================

/// Keep-alive republish interval while connected.
pub const ACTIVITY_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delay before the supervisor retries after an unexpected disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default countdown length when no explicit end timestamp is given.
pub const COUNTDOWN_DEFAULT: Duration = Duration::from_secs(60 * 60);

// ============================================================================
// Protocol
// ============================================================================

/// Close code the host sends when it rejects the connecting origin.
pub const CLOSE_ORIGIN_REJECTED: u16 = 4001;

/// OAuth scope requested by `AUTHORIZE`.
pub const RPC_SCOPE: &str = "rpc";

/// Prefix for generated nonces and synthesized party ids.
pub const ID_PREFIX: &str = "presence";

/// Returns the default candidate ports in ascending order.
#[must_use]
pub fn default_ports() -> Vec<u16> {
    port_range(RPC_PORT_START, RPC_PORT_COUNT)
}

/// Builds `count` contiguous ports starting at `start`, saturating at `u16::MAX`.
#[must_use]
pub fn port_range(start: u16, count: u16) -> Vec<u16> {
    (0..count)
        .filter_map(|offset| start.checked_add(offset))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_cover_ten_contiguous() {
        let ports = default_ports();
        assert_eq!(ports.len(), 10);
        assert_eq!(ports.first(), Some(&6463));
        assert_eq!(ports.last(), Some(&6472));
        assert!(ports.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_port_range_saturates() {
        let ports = port_range(u16::MAX - 1, 5);
        assert_eq!(ports, vec![u16::MAX - 1, u16::MAX]);
    }

    #[test]
    fn test_timeout_values_are_reasonable() {
        // A full scan must finish well inside one command window.
        assert!(PROBE_TIMEOUT * u32::from(RPC_PORT_COUNT) <= COMMAND_TIMEOUT * 2);
        assert!(RECONNECT_DELAY < ACTIVITY_REFRESH_INTERVAL);
    }
}

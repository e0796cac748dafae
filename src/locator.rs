//! Endpoint discovery.
//!
//! The chat client listens on one port of a small contiguous range. The
//! locator walks the range in ascending order, one port at a time, and stops
//! at the first port that opens a socket and delivers the `READY` dispatch
//! within the probe timeout.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::constants::{default_ports, CLOSE_ORIGIN_REJECTED, PROBE_TIMEOUT, RPC_HOST};
use crate::correlator::{Correlator, LinkEvent, Router};
use crate::error::{PresenceError, PresenceResult};
use crate::frame::Frame;
use crate::state::{ConnectionState, StateCell};
use crate::transport::{Connection, FrameSender};
use crate::ws::endpoint_url;

/// Where and how to look for the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Loopback host.
    pub host: String,
    /// Candidate ports, tried in order.
    pub ports: Vec<u16>,
    /// Budget for connect + upgrade + `READY` on one port.
    pub probe_timeout: Duration,
    /// `Origin` header to present, if any.
    pub origin: Option<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            host: RPC_HOST.to_string(),
            ports: default_ports(),
            probe_timeout: PROBE_TIMEOUT,
            origin: None,
        }
    }
}

/// A socket that has delivered `READY`, plus the events it will deliver next.
#[derive(Debug)]
pub struct Link {
    /// The open connection.
    pub connection: Connection,
    /// Unsolicited frames and close/error notifications.
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    /// The `READY` dispatch itself.
    pub ready: Frame,
}

impl Link {
    /// Sender for commands on this link.
    pub fn sender(&self) -> FrameSender {
        self.connection.sender()
    }

    /// Port the link is bound to.
    pub fn port(&self) -> u16 {
        self.connection.port()
    }

    /// Close the socket.
    pub async fn close(self) {
        self.connection.close().await;
    }
}

/// Scan the candidate ports for a live endpoint.
///
/// Moves the state to `Connecting`, to `AwaitingReady` each time a socket
/// opens, and back to `Connecting` when that port is abandoned.
///
/// # Errors
///
/// `OriginRejected` as soon as a port closes with the origin-rejected code;
/// `EndpointNotFound` once every port has been tried.
pub async fn locate(
    settings: &EndpointSettings,
    client_id: &str,
    correlator: &Correlator,
    state: &StateCell,
) -> PresenceResult<Link> {
    state.transition(ConnectionState::Connecting);

    for &port in &settings.ports {
        let attempt = tokio::time::timeout(
            settings.probe_timeout,
            probe(settings, port, client_id, correlator, state),
        )
        .await;

        match attempt {
            Ok(Ok(link)) => {
                log::info!("[Locator] Endpoint ready on port {}", port);
                return Ok(link);
            }
            Ok(Err(PresenceError::OriginRejected)) => {
                log::warn!("[Locator] Port {} rejected our origin", port);
                return Err(PresenceError::OriginRejected);
            }
            Ok(Err(e)) => log::debug!("[Locator] Port {}: {}", port, e),
            Err(_elapsed) => log::debug!("[Locator] Port {}: no ready signal in time", port),
        }
        state.transition(ConnectionState::Connecting);
    }

    log::warn!("[Locator] No endpoint on ports {:?}", settings.ports);
    Err(PresenceError::EndpointNotFound)
}

async fn probe(
    settings: &EndpointSettings,
    port: u16,
    client_id: &str,
    correlator: &Correlator,
    state: &StateCell,
) -> PresenceResult<Link> {
    let url = endpoint_url(&settings.host, port, client_id);
    let headers: Vec<(&str, &str)> = settings
        .origin
        .as_deref()
        .map(|origin| ("Origin", origin))
        .into_iter()
        .collect();

    let (router, mut events) = Router::channel(correlator.clone());
    let connection = Connection::open(&url, port, &headers, router).await?;
    state.transition(ConnectionState::AwaitingReady);

    loop {
        match events.recv().await {
            Some(LinkEvent::Dispatch(frame)) if frame.is_ready() => {
                return Ok(Link {
                    connection,
                    events,
                    ready: frame,
                });
            }
            Some(LinkEvent::Dispatch(frame)) if frame.is_error() => {
                let message = frame.error_message();
                connection.close().await;
                return Err(PresenceError::Rpc(message));
            }
            Some(LinkEvent::Dispatch(frame)) => {
                log::debug!("[Locator] Ignoring {} before ready", frame.label());
            }
            Some(LinkEvent::Closed { code, .. }) if code == CLOSE_ORIGIN_REJECTED => {
                return Err(PresenceError::OriginRejected);
            }
            Some(LinkEvent::Closed { code, reason }) => {
                return Err(PresenceError::ConnectionClosed { code, reason });
            }
            Some(LinkEvent::Failed(e)) => return Err(PresenceError::Transport(e)),
            None => return Err(PresenceError::Transport("event channel closed".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionEvent;
    use std::net::TcpListener;
    use std::time::Instant;

    fn free_ports(n: usize) -> Vec<u16> {
        let listeners: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    fn settings(ports: Vec<u16>, probe_timeout: Duration) -> EndpointSettings {
        EndpointSettings {
            ports,
            probe_timeout,
            ..EndpointSettings::default()
        }
    }

    #[test]
    fn test_default_settings_scan_ten_loopback_ports() {
        let settings = EndpointSettings::default();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.ports.len(), 10);
        assert_eq!(settings.probe_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_all_ports_refused_reports_endpoint_not_found() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let state = StateCell::new();
        let settings = settings(free_ports(10), Duration::from_millis(500));

        let started = Instant::now();
        let result = locate(&settings, "1", &correlator, &state).await;

        assert!(matches!(result, Err(PresenceError::EndpointNotFound)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(state.get(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_silent_ports_are_abandoned_after_probe_timeout() {
        // Listeners that accept TCP but never answer the upgrade.
        let listeners: Vec<TcpListener> = (0..3)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let ports = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();
        let settings = settings(ports, Duration::from_millis(100));
        let correlator = Correlator::new(Duration::from_secs(30));
        let state = StateCell::new();
        let mut events = state.subscribe();

        let started = Instant::now();
        let result = locate(&settings, "1", &correlator, &state).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(PresenceError::EndpointNotFound)));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(3));

        // Never got past the TCP level, so never awaited ready.
        while let Ok(event) = events.try_recv() {
            assert_ne!(
                event,
                SessionEvent::StateChanged {
                    from: ConnectionState::Connecting,
                    to: ConnectionState::AwaitingReady
                }
            );
        }
        drop(listeners);
    }
}

//! Connection handshake: locate → `READY` → `AUTHORIZE` → `AUTHENTICATE`.
//!
//! [`establish`] drives one complete attempt and returns an authenticated
//! [`Link`]. The session task polls it as a single future, so a handshake
//! can be abandoned at any suspension point by dropping it.
//!
//! While a handshake command is in flight the link's event stream is watched
//! too: a socket close or an unsolicited `ERROR` frame aborts the attempt
//! instead of waiting out the command timeout.

use std::sync::Arc;

use serde_json::json;

use crate::companion::TokenExchange;
use crate::constants::{CLOSE_ORIGIN_REJECTED, RPC_SCOPE};
use crate::correlator::{Correlator, LinkEvent, Ticket};
use crate::error::{PresenceError, PresenceResult};
use crate::frame::{cmd, Frame};
use crate::locator::{self, EndpointSettings, Link};
use crate::state::{ConnectionState, StateCell};

/// Everything one handshake attempt needs.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Where to look for the endpoint.
    pub endpoint: EndpointSettings,
    /// Shared command table.
    pub correlator: Correlator,
    /// Session state writer.
    pub state: StateCell,
    /// Fallback used when the raw authorization code is refused.
    pub exchanger: Option<Arc<dyn TokenExchange>>,
}

/// Which handshake command is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Authorize,
    Authenticate,
}

impl Step {
    fn command(self) -> &'static str {
        match self {
            Self::Authorize => cmd::AUTHORIZE,
            Self::Authenticate => cmd::AUTHENTICATE,
        }
    }

    fn rejected(self, message: String) -> PresenceError {
        match self {
            Self::Authorize => PresenceError::AuthorizationDenied(message),
            Self::Authenticate => PresenceError::AuthenticationFailed(message),
        }
    }
}

/// Outcome of one awaited step that did not succeed.
#[derive(Debug)]
enum StepError {
    /// The command itself was rejected or timed out. Recoverable for
    /// `AUTHENTICATE` via the token exchange.
    Command(PresenceError),
    /// The link is unusable; the handshake is over.
    Fatal(PresenceError),
}

impl StepError {
    fn into_error(self, step: Step) -> PresenceError {
        match self {
            Self::Command(PresenceError::Rpc(message)) => step.rejected(message),
            Self::Command(PresenceError::CommandTimeout(cmd)) => PresenceError::HandshakeTimeout(cmd),
            Self::Command(other) | Self::Fatal(other) => other,
        }
    }
}

impl Handshake {
    /// Run one full attempt for `client_id`.
    ///
    /// On failure every pending command is cancelled and the socket closed
    /// before the error is returned. The caller moves the state to
    /// `Disconnected`.
    pub async fn establish(self, client_id: String) -> PresenceResult<Link> {
        let mut link = locator::locate(&self.endpoint, &client_id, &self.correlator, &self.state).await?;
        log::info!(
            "[Handshake] Ready on port {} (user {})",
            link.port(),
            link.ready.ready_user().unwrap_or("unknown")
        );

        match self.authenticate_link(&mut link, &client_id).await {
            Ok(()) => Ok(link),
            Err(e) => {
                self.correlator.cancel_all();
                link.close().await;
                Err(e)
            }
        }
    }

    async fn authenticate_link(&self, link: &mut Link, client_id: &str) -> PresenceResult<()> {
        self.state.transition(ConnectionState::Authorizing);
        let args = json!({ "client_id": client_id, "scopes": [RPC_SCOPE] });
        let authorized = self
            .run_step(link, Step::Authorize, args)
            .await
            .map_err(|e| e.into_error(Step::Authorize))?;
        let code = authorized
            .data_str("code")
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PresenceError::AuthorizationDenied("no authorization code returned".into()))?;
        log::info!("[Handshake] Authorized");

        self.state.transition(ConnectionState::Authenticating);
        match self.run_step(link, Step::Authenticate, json!({ "access_token": code })).await {
            Ok(_) => {}
            Err(StepError::Fatal(e)) => return Err(e),
            Err(StepError::Command(original)) => {
                log::info!("[Handshake] Direct authentication failed ({}), trying token exchange", original);
                self.authenticate_via_exchange(link, client_id, &code, original).await?;
            }
        }

        self.state.transition(ConnectionState::Connected);
        log::info!("[Handshake] Authenticated");
        Ok(())
    }

    async fn authenticate_via_exchange(
        &self,
        link: &mut Link,
        client_id: &str,
        code: &str,
        original: PresenceError,
    ) -> PresenceResult<()> {
        let original = StepError::Command(original).into_error(Step::Authenticate);

        let Some(exchanger) = self.exchanger.as_ref() else {
            return Err(original);
        };
        let token = match exchanger.exchange(client_id, code).await {
            Ok(token) => token,
            Err(e) => {
                log::warn!("[Handshake] {}", e);
                return Err(original);
            }
        };

        match self.run_step(link, Step::Authenticate, json!({ "access_token": token })).await {
            Ok(_) => Ok(()),
            Err(StepError::Fatal(e)) => Err(e),
            Err(StepError::Command(e)) => {
                log::warn!("[Handshake] Exchanged token refused: {}", e);
                Err(original)
            }
        }
    }

    async fn run_step(&self, link: &mut Link, step: Step, args: serde_json::Value) -> Result<Frame, StepError> {
        let ticket = self
            .correlator
            .dispatch(&link.sender(), step.command(), args)
            .map_err(StepError::Fatal)?;
        await_with_link(ticket, link, step).await
    }
}

/// Wait for `ticket` while watching the link for fatal events.
async fn await_with_link(ticket: Ticket, link: &mut Link, step: Step) -> Result<Frame, StepError> {
    let wait = ticket.wait();
    tokio::pin!(wait);

    loop {
        tokio::select! {
            result = &mut wait => return result.map_err(StepError::Command),
            event = link.events.recv() => match event {
                Some(LinkEvent::Dispatch(frame)) if frame.is_error() => {
                    return Err(StepError::Fatal(step.rejected(frame.error_message())));
                }
                Some(LinkEvent::Dispatch(frame)) => {
                    log::debug!("[Handshake] Ignoring {} during {}", frame.label(), step.command());
                }
                Some(LinkEvent::Closed { code, .. }) if code == CLOSE_ORIGIN_REJECTED => {
                    return Err(StepError::Fatal(PresenceError::OriginRejected));
                }
                Some(LinkEvent::Closed { code, reason }) => {
                    return Err(StepError::Fatal(PresenceError::ConnectionClosed { code, reason }));
                }
                Some(LinkEvent::Failed(e)) => return Err(StepError::Fatal(PresenceError::Transport(e))),
                None => return Err(StepError::Fatal(PresenceError::Transport("event channel closed".into()))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_maps_to_step_error() {
        assert_eq!(
            StepError::Command(PresenceError::Rpc("denied".into())).into_error(Step::Authorize),
            PresenceError::AuthorizationDenied("denied".into())
        );
        assert_eq!(
            StepError::Command(PresenceError::Rpc("bad token".into())).into_error(Step::Authenticate),
            PresenceError::AuthenticationFailed("bad token".into())
        );
    }

    #[test]
    fn test_command_timeout_maps_to_handshake_timeout() {
        assert_eq!(
            StepError::Command(PresenceError::CommandTimeout("AUTHORIZE".into())).into_error(Step::Authorize),
            PresenceError::HandshakeTimeout("AUTHORIZE".into())
        );
    }

    #[test]
    fn test_fatal_errors_pass_through() {
        let closed = PresenceError::ConnectionClosed {
            code: 1006,
            reason: String::new(),
        };
        assert_eq!(
            StepError::Fatal(closed.clone()).into_error(Step::Authenticate),
            closed
        );
        assert_eq!(
            StepError::Fatal(PresenceError::OriginRejected).into_error(Step::Authorize),
            PresenceError::OriginRejected
        );
    }
}

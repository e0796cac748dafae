//! rpc-presence - local RPC presence client engine.
//!
//! This crate discovers a chat client's local RPC endpoint, authenticates
//! against it, publishes a presence activity and keeps it alive across
//! disconnects.
//!
//! # Architecture
//!
//! Leaf to root:
//!
//! - **Locator** - scans the candidate ports for a live endpoint
//! - **Transport** - one WebSocket, framed as JSON, reader and writer tasks
//! - **Correlator** - nonce-keyed pending-command table with timeouts
//! - **Handshake** - `READY` → `AUTHORIZE` → `AUTHENTICATE` (with token exchange fallback)
//! - **Activity** - config → wire payload, `SET_ACTIVITY`
//! - **Supervisor** - fixed-delay reconnect policy
//! - **Session** - the actor that owns all of the above behind [`PresenceClient`]
//!
//! # Modules
//!
//! - [`session`] - [`PresenceClient`] handle and engine settings
//! - [`activity`] - presence configuration and payload mapping
//! - [`config`] - configuration loading/saving

// Library modules
pub mod activity;
pub mod companion;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod locator;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use activity::{
    build_activity, set_activity_args, ActivityClock, ActivityPayload, Button, PresenceConfig,
    TimestampsMode,
};
pub use companion::{CompanionClient, TokenExchange};
pub use config::Config;
pub use error::{PresenceError, PresenceResult};
pub use locator::EndpointSettings;
pub use session::{EngineSettings, PresenceClient};
pub use state::{ConnectionState, SessionEvent};

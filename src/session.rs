//! Session actor and the public client handle.
//!
//! # Architecture
//!
//! ```text
//! PresenceClient ──Command──► session task (select loop)
//!                                │  owns: desired config, link, timers,
//!                                │        in-flight handshake and publish
//!                                ├─► Handshake::establish (boxed future)
//!                                ├─► activity::publish   (boxed future)
//!                                └─► Supervisor timer
//!   socket reader task ─► Correlator table
//!                      └► LinkEvent ─► session task
//! ```
//!
//! Every state transition, timer and publish runs on the session task. The
//! socket reader only touches the correlator table and forwards everything
//! else as [`LinkEvent`]s, so the session never races with itself.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::activity::{self, build_activity, ActivityClock, PresenceConfig};
use crate::companion::{CompanionClient, TokenExchange};
use crate::constants::{
    ACTIVITY_REFRESH_INTERVAL, CLEAR_TIMEOUT, CLOSE_ORIGIN_REJECTED, COMMAND_TIMEOUT,
    RECONNECT_DELAY,
};
use crate::correlator::{Correlator, LinkEvent};
use crate::error::{PresenceError, PresenceResult};
use crate::handshake::Handshake;
use crate::locator::{EndpointSettings, Link};
use crate::state::{ConnectionState, SessionEvent, StateCell};
use crate::supervisor::{DisconnectCause, Supervisor};

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Endpoint discovery.
    pub endpoint: EndpointSettings,
    /// Response window for correlated commands.
    pub command_timeout: Duration,
    /// Keep-alive republish interval.
    pub refresh_interval: Duration,
    /// Delay before an automatic reconnect.
    pub reconnect_delay: Duration,
    /// Companion service base URL (token exchange, connected notification).
    pub companion_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            endpoint: EndpointSettings::default(),
            command_timeout: COMMAND_TIMEOUT,
            refresh_interval: ACTIVITY_REFRESH_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
            companion_url: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect {
        config: PresenceConfig,
        reply: oneshot::Sender<PresenceResult<()>>,
    },
    Update(PresenceConfig),
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to a running presence session.
///
/// Dropping every handle shuts the session down.
#[derive(Debug)]
pub struct PresenceClient {
    commands: mpsc::UnboundedSender<Command>,
    state: StateCell,
    task: JoinHandle<()>,
}

impl PresenceClient {
    /// Start a session task using the companion service from `settings` for
    /// the token exchange.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(settings: EngineSettings) -> PresenceResult<Self> {
        let companion = companion_client(&settings)?;
        let exchanger = companion
            .clone()
            .map(|c| Arc::new(c) as Arc<dyn TokenExchange>);
        Ok(Self::spawn_inner(settings, companion, exchanger))
    }

    /// Start a session task with a caller-supplied token exchange.
    pub fn spawn_with_exchanger(
        settings: EngineSettings,
        exchanger: Arc<dyn TokenExchange>,
    ) -> PresenceResult<Self> {
        let companion = companion_client(&settings)?;
        Ok(Self::spawn_inner(settings, companion, Some(exchanger)))
    }

    fn spawn_inner(
        settings: EngineSettings,
        companion: Option<CompanionClient>,
        exchanger: Option<Arc<dyn TokenExchange>>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = StateCell::new();
        let task = SessionTask {
            correlator: Correlator::new(settings.command_timeout),
            supervisor: Supervisor::new(settings.reconnect_delay),
            settings,
            state: state.clone(),
            exchanger,
            companion,
            commands: rx,
            desired: None,
            link: None,
            attempt: None,
            pending_reply: None,
            publish: None,
            republish: false,
            refresh: None,
            connected_at: None,
            app_started_at: chrono::Utc::now().timestamp(),
        };
        let task = tokio::spawn(task.run());
        Self {
            commands,
            state,
            task,
        }
    }

    /// Connect and publish `config`.
    ///
    /// Resolves once the session reaches `Connected`, or with the reason the
    /// first attempt failed. Retries after that are reported as events.
    pub async fn connect(&self, config: PresenceConfig) -> PresenceResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { config, reply })
            .map_err(|_closed| PresenceError::Cancelled)?;
        rx.await.unwrap_or(Err(PresenceError::Cancelled))
    }

    /// Replace the desired configuration; republishes if connected.
    pub fn update(&self, config: PresenceConfig) -> PresenceResult<()> {
        self.commands
            .send(Command::Update(config))
            .map_err(|_closed| PresenceError::Cancelled)
    }

    /// Clear the activity, close the socket and stop reconnecting.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Receiver that tracks the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    /// Receiver for state changes, errors and publish acknowledgements.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.subscribe()
    }

    /// Disconnect and stop the session task.
    pub async fn shutdown(self) {
        self.disconnect().await;
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

fn companion_client(settings: &EngineSettings) -> PresenceResult<Option<CompanionClient>> {
    settings
        .companion_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .map(CompanionClient::new)
        .transpose()
}

struct SessionTask {
    settings: EngineSettings,
    state: StateCell,
    correlator: Correlator,
    supervisor: Supervisor,
    exchanger: Option<Arc<dyn TokenExchange>>,
    companion: Option<CompanionClient>,
    commands: mpsc::UnboundedReceiver<Command>,

    /// Set while the owner wants a session; gates automatic reconnection.
    desired: Option<PresenceConfig>,
    /// Authenticated link, present only while `Connected`.
    link: Option<Link>,
    attempt: Option<BoxFuture<'static, PresenceResult<Link>>>,
    pending_reply: Option<oneshot::Sender<PresenceResult<()>>>,
    publish: Option<BoxFuture<'static, PresenceResult<()>>>,
    /// A publish was requested while another was in flight.
    republish: bool,
    refresh: Option<Interval>,
    connected_at: Option<i64>,
    app_started_at: i64,
}

async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => future::pending().await,
    }
}

async fn next_link_event(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link.as_mut() {
        Some(link) => link.events.recv().await,
        None => future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

impl SessionTask {
    async fn run(mut self) {
        log::debug!("[Session] Task started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect { config, reply }) => self.on_connect(config, reply).await,
                    Some(Command::Update(config)) => self.on_update(config).await,
                    Some(Command::Disconnect { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                result = poll_slot(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt_done(result);
                }
                event = next_link_event(&mut self.link) => self.on_link_event(event),
                result = poll_slot(&mut self.publish) => {
                    self.publish = None;
                    self.on_publish_done(result);
                }
                () = next_tick(&mut self.refresh) => self.request_publish(),
                () = self.supervisor.wait() => {
                    self.supervisor.fire();
                    self.on_reconnect_timer();
                }
            }
        }
        self.teardown().await;
        log::debug!("[Session] Task stopped");
    }

    async fn on_connect(&mut self, config: PresenceConfig, reply: oneshot::Sender<PresenceResult<()>>) {
        if let Some(previous) = self.pending_reply.take() {
            let _ = previous.send(Err(PresenceError::Cancelled));
        }
        self.supervisor.cancel();

        let same_app = self
            .desired
            .as_ref()
            .is_some_and(|d| d.application_id == config.application_id);

        if same_app && self.link.is_some() {
            log::info!("[Session] Already connected, updating activity");
            self.desired = Some(config);
            self.request_publish();
            let _ = reply.send(Ok(()));
            return;
        }

        self.drop_link(true).await;
        self.desired = Some(config);
        self.pending_reply = Some(reply);
        self.start_attempt();
    }

    async fn on_update(&mut self, config: PresenceConfig) {
        let Some(current) = self.desired.as_ref() else {
            log::debug!("[Session] Ignoring update without an active session");
            return;
        };

        if current.application_id != config.application_id {
            log::info!("[Session] Application changed, reconnecting");
            self.drop_link(true).await;
            self.desired = Some(config);
            self.supervisor.cancel();
            self.start_attempt();
            return;
        }

        self.desired = Some(config);
        if self.link.is_some() {
            self.request_publish();
        }
    }

    fn start_attempt(&mut self) {
        let Some(config) = self.desired.as_ref() else {
            return;
        };
        if self.attempt.take().is_some() {
            log::debug!("[Session] Abandoning in-flight handshake");
            self.correlator.cancel_all();
        }
        self.state.transition(ConnectionState::Disconnected);

        let handshake = Handshake {
            endpoint: self.settings.endpoint.clone(),
            correlator: self.correlator.clone(),
            state: self.state.clone(),
            exchanger: self.exchanger.clone(),
        };
        log::info!("[Session] Connecting for application {}", config.application_id);
        self.attempt = Some(handshake.establish(config.application_id.clone()).boxed());
    }

    fn on_attempt_done(&mut self, result: PresenceResult<Link>) {
        match result {
            Ok(link) => {
                log::info!("[Session] Connected on port {}", link.port());
                self.link = Some(link);
                self.connected_at = Some(chrono::Utc::now().timestamp());

                let period = self.settings.refresh_interval;
                let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.refresh = Some(refresh);

                if let Some(reply) = self.pending_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                self.request_publish();
                self.report_connected();
            }
            Err(e) => {
                self.state.transition(ConnectionState::Disconnected);
                self.state.report(e.clone());
                if let Some(reply) = self.pending_reply.take() {
                    let _ = reply.send(Err(e.clone()));
                }
                self.after_disconnect(&DisconnectCause::HandshakeFailed(e));
            }
        }
    }

    fn on_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            Some(LinkEvent::Dispatch(frame)) if frame.is_error() => {
                self.state.report(PresenceError::Rpc(frame.error_message()));
            }
            Some(LinkEvent::Dispatch(frame)) => {
                log::debug!("[Session] Unsolicited {}", frame.label());
            }
            Some(LinkEvent::Closed { code, reason }) => self.on_link_lost(code, reason),
            Some(LinkEvent::Failed(e)) => self.on_link_lost(1006, e),
            None => self.on_link_lost(1006, "event channel closed".into()),
        }
    }

    fn on_link_lost(&mut self, code: u16, reason: String) {
        log::warn!("[Session] Connection lost (code {}: {})", code, reason);
        self.link = None;
        self.clear_connected();
        self.state.transition(ConnectionState::Disconnected);

        let error = if code == CLOSE_ORIGIN_REJECTED {
            PresenceError::OriginRejected
        } else {
            PresenceError::ConnectionClosed {
                code,
                reason: reason.clone(),
            }
        };
        self.state.report(error);
        self.after_disconnect(&DisconnectCause::LinkLost { code, reason });
    }

    fn after_disconnect(&mut self, cause: &DisconnectCause) {
        if self.supervisor.on_disconnect(cause, self.desired.is_some()) {
            self.state.emit(SessionEvent::ReconnectScheduled {
                delay_ms: self.supervisor.delay().as_millis() as u64,
            });
        }
    }

    fn on_reconnect_timer(&mut self) {
        if self.desired.is_none() || self.link.is_some() || self.attempt.is_some() {
            return;
        }
        log::info!("[Session] Reconnecting");
        self.start_attempt();
    }

    fn request_publish(&mut self) {
        if self.publish.is_some() {
            self.republish = true;
            return;
        }
        let (Some(link), Some(config)) = (self.link.as_ref(), self.desired.as_ref()) else {
            return;
        };

        let clock = ActivityClock::now(self.connected_at, self.app_started_at);
        let payload = build_activity(config, &clock);
        let correlator = self.correlator.clone();
        let sender = link.sender();
        log::debug!("[Session] Publishing activity");
        self.publish = Some(
            async move { activity::publish(&correlator, &sender, &payload).await }.boxed(),
        );
    }

    fn on_publish_done(&mut self, result: PresenceResult<()>) {
        match result {
            Ok(()) => {
                log::info!("[Session] Activity published");
                self.state.emit(SessionEvent::ActivityPublished);
            }
            Err(PresenceError::Cancelled) => {}
            Err(e) => self.state.report(e),
        }
        if std::mem::take(&mut self.republish) {
            self.request_publish();
        }
    }

    fn report_connected(&self) {
        let (Some(companion), Some(config_id)) = (
            self.companion.clone(),
            self.desired.as_ref().and_then(|d| d.config_id.clone()),
        ) else {
            return;
        };
        tokio::spawn(async move { companion.report_connected(&config_id).await });
    }

    fn clear_connected(&mut self) {
        self.refresh = None;
        self.publish = None;
        self.republish = false;
        self.connected_at = None;
        self.correlator.cancel_all();
    }

    /// Close the current link, clearing the remote activity first when
    /// `clear` is set and the session is connected.
    async fn drop_link(&mut self, clear: bool) {
        if self.attempt.take().is_some() {
            log::debug!("[Session] Abandoning in-flight handshake");
        }
        self.clear_connected();

        if let Some(link) = self.link.take() {
            if clear {
                let sender = link.sender();
                match tokio::time::timeout(CLEAR_TIMEOUT, activity::clear(&self.correlator, &sender)).await {
                    Ok(Ok(())) => log::debug!("[Session] Activity cleared"),
                    Ok(Err(e)) => log::debug!("[Session] Clearing activity failed: {}", e),
                    Err(_elapsed) => log::debug!("[Session] Clearing activity timed out"),
                }
                self.correlator.cancel_all();
            }
            link.close().await;
        }
        self.state.transition(ConnectionState::Disconnected);
    }

    async fn teardown(&mut self) {
        self.desired = None;
        self.supervisor.cancel();
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Err(PresenceError::Cancelled));
        }
        self.drop_link(true).await;
        log::info!("[Session] Disconnected");
    }
}

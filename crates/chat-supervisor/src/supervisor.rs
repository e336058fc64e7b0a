//! Connection supervisor driver
//!
//! A single task owns the state machine and the live session. Everything
//! else (start, manual reconnects, close notifications, health probes)
//! enqueues a command on its channel, so transitions are serialized and at
//! most one connect attempt is ever in flight.
//!
//! Each session gets a close watcher that reports back tagged with the
//! session id; a close from a session that has since been replaced is
//! ignored.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{Notification, NotificationSink};
use credential_store::CredentialStore;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use twitch_auth::CredentialClass;
use uuid::Uuid;

use crate::backoff::DEFAULT_MAX_ATTEMPTS;
use crate::error::{Error, Result};
use crate::machine::{
    ConnectionState, SupervisorAction, SupervisorEvent, SupervisorState, handle_event,
};
use crate::transport::{BoxFuture, ChatLogin, ChatSession, ChatTransport};

const COMPONENT: &str = "chat-supervisor";

/// Handshake timeout for one connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Supplies the chat token for each connect attempt.
pub trait ChatTokenSource: Send + Sync {
    fn chat_token(&self) -> BoxFuture<'_, Result<String>>;

    /// The chat service refused the last token. Sources that can mint a
    /// replacement should do so before the next attempt.
    fn token_rejected(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

impl ChatTokenSource for CredentialStore {
    fn chat_token(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let token = self
                .get_valid_token(CredentialClass::Chat)
                .await
                .map_err(|e| Error::Token(e.to_string()))?;
            if token.degraded {
                warn!("connecting with a degraded chat token");
            }
            Ok(token.access_token)
        })
    }

    fn token_rejected(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!("chat login rejected, renewing chat token");
            if !self.force_refresh(CredentialClass::Chat).await {
                warn!("chat token renewal after rejected login failed");
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub channel: String,
    pub bot_username: String,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(channel: impl Into<String>, bot_username: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            bot_username: bot_username.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Snapshot published after every transition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub channel: String,
    pub bot_username: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_delay_secs: Option<u64>,
    pub last_connected_at: Option<u64>,
    pub last_attempt_at: Option<u64>,
    pub last_error: Option<String>,
}

enum Command {
    Event(SupervisorEvent),
    Probe,
    TransportLost,
    SessionClosed(Uuid),
    ForceReconnect(oneshot::Sender<bool>),
    Say(String, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ChatStatus>,
}

impl SupervisorHandle {
    /// Begin connecting. Returns once the first attempt has been queued.
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Event(SupervisorEvent::Start)).await
    }

    /// Drop any pending retry, reset the budget and connect now. Returns
    /// whether the new connection came up.
    pub async fn force_reconnect(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::ForceReconnect(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Report that the current session's transport went away.
    pub async fn on_transport_closed(&self) -> Result<()> {
        self.send(Command::TransportLost).await
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub fn status(&self) -> ChatStatus {
        self.status.borrow().clone()
    }

    /// Send a line to the joined channel.
    pub async fn say(&self, text: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Say(text.into(), tx)).await?;
        rx.await.map_err(|_| Error::SupervisorGone)?
    }

    /// Close the session and stop the driver.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) async fn probe(&self) -> Result<()> {
        self.send(Command::Probe).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::SupervisorGone)
    }
}

/// Owner of the chat connection lifecycle.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    transport: Arc<dyn ChatTransport>,
    tokens: Arc<dyn ChatTokenSource>,
    sink: Arc<dyn NotificationSink>,
    state: SupervisorState,
    session: Option<ChatSession>,
    retry_at: Option<Instant>,
    commands: mpsc::WeakSender<Command>,
    status_tx: watch::Sender<ChatStatus>,
    last_connected_at: Option<u64>,
    last_attempt_at: Option<u64>,
    last_error: Option<String>,
}

impl ConnectionSupervisor {
    /// Spawn the driver task. Nothing connects until `start` is called.
    pub fn spawn(
        config: SupervisorConfig,
        transport: Arc<dyn ChatTransport>,
        tokens: Arc<dyn ChatTokenSource>,
        sink: Arc<dyn NotificationSink>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(64);
        let state = SupervisorState::new(config.max_attempts);
        let (status_tx, status_rx) = watch::channel(ChatStatus {
            state: state.phase,
            connected: false,
            channel: config.channel.clone(),
            bot_username: config.bot_username.clone(),
            attempts: 0,
            max_attempts: config.max_attempts,
            next_delay_secs: None,
            last_connected_at: None,
            last_attempt_at: None,
            last_error: None,
        });
        metrics::gauge!("chat_connected").set(0.0);

        let span = info_span!("chat_supervisor", channel = %config.channel);
        let driver = ConnectionSupervisor {
            config,
            transport,
            tokens,
            sink,
            state,
            session: None,
            retry_at: None,
            commands: tx.downgrade(),
            status_tx,
            last_connected_at: None,
            last_attempt_at: None,
            last_error: None,
        };
        tokio::spawn(driver.run(rx).instrument(span));

        SupervisorHandle {
            commands: tx,
            status: status_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("connection supervisor started");
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if let Some(ack) = self.handle_command(command).await {
                        rx.close();
                        let _ = ack.send(());
                        break;
                    }
                }
                _ = sleep_until_opt(retry_at), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.dispatch(SupervisorEvent::RetryTimer).await;
                }
            }
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        metrics::gauge!("chat_connected").set(0.0);
        info!("connection supervisor stopped");
    }

    /// Returns the shutdown acknowledgement once the driver should stop.
    async fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Event(event) => self.dispatch(event).await,
            Command::Probe => {
                let transport_alive = self.session.as_ref().is_some_and(ChatSession::is_alive);
                debug!(transport_alive, state = self.state.phase.label(), "health probe");
                self.dispatch(SupervisorEvent::ProbeTick { transport_alive })
                    .await;
            }
            Command::TransportLost => {
                if self.session.take().is_some() {
                    self.dispatch(SupervisorEvent::TransportClosed).await;
                }
            }
            Command::SessionClosed(id) => {
                if self.session.as_ref().is_some_and(|s| s.id() == id) {
                    info!(session_id = %id, "chat transport closed");
                    self.session = None;
                    self.dispatch(SupervisorEvent::TransportClosed).await;
                } else {
                    debug!(session_id = %id, "ignoring close from replaced session");
                }
            }
            Command::ForceReconnect(reply) => {
                info!("manual reconnect requested");
                self.dispatch(SupervisorEvent::ForceReconnect).await;
                let _ = reply.send(self.state.phase == ConnectionState::Connected);
            }
            Command::Say(text, reply) => {
                let result = match &self.session {
                    Some(session) if self.state.phase == ConnectionState::Connected => {
                        session.send(text).await
                    }
                    _ => Err(Error::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown(ack) => {
                self.dispatch(SupervisorEvent::Shutdown).await;
                return Some(ack);
            }
        }
        None
    }

    /// Feed one event through the machine and run the resulting actions.
    /// A connect attempt produces a follow-up event, handled in the same
    /// loop.
    async fn dispatch(&mut self, event: SupervisorEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let trigger = event.trigger();
            let (state, action) = handle_event(self.state.clone(), event);
            self.state = state;

            match action {
                SupervisorAction::Connect => {
                    self.retry_at = None;
                    metrics::counter!("chat_reconnect_attempts_total", "trigger" => trigger)
                        .increment(1);
                    next = Some(self.connect().await);
                }
                SupervisorAction::ScheduleRetry {
                    delay,
                    attempt,
                    persistent_failure,
                } => {
                    if let Some(session) = self.session.take() {
                        session.close();
                    }
                    warn!(
                        attempt,
                        max_attempts = self.state.budget.max_attempts,
                        delay_secs = delay.as_secs(),
                        "chat reconnect scheduled"
                    );
                    if persistent_failure {
                        error!(attempt, "chat reconnect budget exhausted");
                        let mut notification = Notification::critical(
                            COMPONENT,
                            format!(
                                "persistent reconnect failure: {} attempts to join #{} failed",
                                attempt, self.config.channel
                            ),
                        );
                        if let Some(e) = &self.last_error {
                            notification = notification.with_detail(e);
                        }
                        self.sink.notify(notification);
                    }
                    self.retry_at = Some(Instant::now() + delay);
                }
                SupervisorAction::Disconnect => {
                    self.retry_at = None;
                    if let Some(session) = self.session.take() {
                        session.close();
                    }
                    info!("chat disconnected");
                }
                SupervisorAction::None => {}
            }
            self.publish();
        }
    }

    /// One connect attempt. Returns the event describing its outcome.
    async fn connect(&mut self) -> SupervisorEvent {
        if let Some(previous) = self.session.take() {
            debug!(session_id = %previous.id(), "closing previous session");
            previous.close();
        }
        self.last_attempt_at = Some(unix_millis());
        self.publish();

        let access_token = match self.tokens.chat_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "cannot connect to chat without a token");
                self.sink.notify(
                    Notification::warning(COMPONENT, "failed to obtain chat token")
                        .with_detail(&e),
                );
                self.last_error = Some(e.to_string());
                return SupervisorEvent::ConnectFailed {
                    clean: e.is_clean_failure(),
                };
            }
        };

        let login = ChatLogin {
            username: self.config.bot_username.clone(),
            channel: self.config.channel.clone(),
            access_token,
        };

        let result =
            match tokio::time::timeout(self.config.connect_timeout, self.transport.connect(&login))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.config.connect_timeout)),
            };

        match result {
            Ok(session) => {
                let id = session.id();
                self.watch_session(&session);
                self.session = Some(session);
                self.last_connected_at = Some(unix_millis());
                self.last_error = None;
                info!(session_id = %id, "chat connected");
                SupervisorEvent::Connected
            }
            Err(e) => {
                warn!(error = %e, "chat connect attempt failed");
                self.last_error = Some(e.to_string());
                if matches!(e, Error::Rejected(_)) {
                    self.tokens.token_rejected().await;
                }
                SupervisorEvent::ConnectFailed {
                    clean: e.is_clean_failure(),
                }
            }
        }
    }

    fn watch_session(&self, session: &ChatSession) {
        let id = session.id();
        let closed = session.closed();
        let commands = self.commands.clone();
        tokio::spawn(
            async move {
                closed.await;
                if let Some(tx) = commands.upgrade() {
                    let _ = tx.send(Command::SessionClosed(id)).await;
                }
            }
            .in_current_span(),
        );
    }

    fn publish(&self) {
        let connected = self.state.phase == ConnectionState::Connected;
        metrics::gauge!("chat_connected").set(if connected { 1.0 } else { 0.0 });
        self.status_tx.send_replace(ChatStatus {
            state: self.state.phase,
            connected,
            channel: self.config.channel.clone(),
            bot_username: self.config.bot_username.clone(),
            attempts: self.state.budget.attempts,
            max_attempts: self.state.budget.max_attempts,
            next_delay_secs: self.state.budget.next_delay.map(|d| d.as_secs()),
            last_connected_at: self.last_connected_at,
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error.clone(),
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

//! Connection lifecycle: registration, session, heartbeat and reconnects.
//!
//! The engine keeps the device registered and connected until stopped.
//! Requests received on the session are handed to the executor one at a
//! time; replies to requests that reconfigure the device network are held
//! back and delivered first on the next session. The held replies live in
//! [`PendingReplies`], which outlives a single engine.

use std::{
    collections::VecDeque,
    fmt,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use fleet_agent_core::AgentContext;
use fleet_agent_executor::{DeviceStats, RequestExecutor};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::jittered,
    channel::{Channel, ChannelError, ConnectionError, Connector},
    identity,
    protocol::{InboundFrame, OutboundFrame},
    registration::{RegistrationError, Registrar},
};

/// Engine state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Unregistered,
    Registering,
    Connecting,
    Connected,
    ReconnectWait,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectWait => "reconnect-wait",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why the engine loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Stopped through the cancellation token.
    Stopped,
    /// The manager rejected registration twice in a row.
    RegistrationAbandoned,
}

/// Replies waiting for the next session, oldest first.
///
/// Clones share the queue, so replies survive the engine being stopped and
/// a new one started.
#[derive(Debug, Clone, Default)]
pub struct PendingReplies(Arc<Mutex<VecDeque<OutboundFrame>>>);

impl PendingReplies {
    fn queue(&self) -> MutexGuard<'_, VecDeque<OutboundFrame>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, frame: OutboundFrame) {
        self.queue().push_back(frame);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    fn front(&self) -> Option<OutboundFrame> {
        self.queue().front().cloned()
    }

    fn pop_front(&self) {
        self.queue().pop_front();
    }
}

enum SessionEnd {
    Stopped,
    /// The identity file disappeared; register again.
    Unregistered,
    HeartbeatExpired,
    RemoteClosed,
    Failed(ConnectionError),
}

pub struct ConnectionEngine {
    context: AgentContext,
    device_id: String,
    executor: Arc<RequestExecutor>,
    registrar: Arc<dyn Registrar>,
    connector: Arc<dyn Connector>,
    state: watch::Sender<EngineState>,
    cancel: CancellationToken,
    pending: PendingReplies,
}

impl ConnectionEngine {
    #[must_use]
    pub fn new(
        context: AgentContext,
        device_id: impl Into<String>,
        executor: Arc<RequestExecutor>,
        registrar: Arc<dyn Registrar>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Unregistered);
        Self {
            context,
            device_id: device_id.into(),
            executor,
            registrar,
            connector,
            state,
            cancel: CancellationToken::new(),
            pending: PendingReplies::default(),
        }
    }

    /// Hold back replies in `pending` instead of a queue of its own.
    #[must_use]
    pub fn with_pending(mut self, pending: PendingReplies) -> Self {
        self.pending = pending;
        self
    }

    /// Receiver of state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Token that stops the engine when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&self, state: EngineState) {
        tracing::debug!(%state, "Engine state changed");
        self.state.send_replace(state);
    }

    /// Run until stopped or registration is abandoned.
    pub async fn run(self) -> EngineExit {
        tracing::info!("Connection loop started");
        let exit = self.run_loop().await;
        self.set_state(EngineState::Stopped);
        match exit {
            EngineExit::Stopped => {
                tracing::info!("Connection loop stopped, use 'fleet-agent start' to start it again");
            }
            EngineExit::RegistrationAbandoned => {
                tracing::error!("Registration abandoned, fix the problem and run 'fleet-agent start'");
            }
        }
        exit
    }

    async fn run_loop(&self) -> EngineExit {
        loop {
            if !self.ensure_registered().await {
                return if self.cancel.is_cancelled() {
                    EngineExit::Stopped
                } else {
                    EngineExit::RegistrationAbandoned
                };
            }

            self.set_state(EngineState::Connecting);
            let end = self.connect_and_serve().await;
            if matches!(end, SessionEnd::Stopped) || self.cancel.is_cancelled() {
                return EngineExit::Stopped;
            }

            let Some(delay) = self.retry_delay(&end) else {
                continue;
            };
            self.set_state(EngineState::ReconnectWait);
            if delay.is_zero() {
                tracing::info!("Reconnecting now");
                continue;
            }
            tracing::info!(secs = delay.as_secs(), "Retrying connection");
            if !self.sleep(delay).await {
                return EngineExit::Stopped;
            }
        }
    }

    /// Sleep for `duration`. Returns `false` if stopped meanwhile.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    fn retry_delay(&self, end: &SessionEnd) -> Option<Duration> {
        let config = &self.context.config;
        match end {
            SessionEnd::Stopped | SessionEnd::Unregistered => None,
            SessionEnd::Failed(ConnectionError::DeviceChangeInitiated) => Some(Duration::ZERO),
            SessionEnd::HeartbeatExpired | SessionEnd::RemoteClosed => {
                Some(jittered(config.retry_interval))
            }
            SessionEnd::Failed(e) if e.retry_soon() || !self.pending.is_empty() => {
                Some(jittered(config.retry_interval))
            }
            SessionEnd::Failed(_) => Some(jittered(config.retry_interval_long)),
        }
    }

    /// Register unless an identity is already stored.
    ///
    /// Returns `false` if stopped or if registration was abandoned.
    async fn ensure_registered(&self) -> bool {
        let identity_file = self.context.identity_file();
        if tokio::fs::try_exists(&identity_file).await.unwrap_or(false) {
            return true;
        }

        self.set_state(EngineState::Registering);
        let token_file = self.context.config.token_file.clone();
        let mut last_rejection: Option<RegistrationError> = None;

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }

            let token = identity::read_token(&token_file).await;
            let result = match &token {
                Some(token) => tokio::select! {
                    () = self.cancel.cancelled() => return false,
                    result = self.registrar.register(token) => result,
                },
                None => Err(RegistrationError::TokenMissing),
            };

            let error = match result {
                Ok(body) => match identity::save_identity(&identity_file, &body).await {
                    Ok(()) => {
                        tracing::info!(path = %identity_file.display(), "Device registered");
                        return true;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to persist device identity");
                        RegistrationError::TransportFailure(e.to_string())
                    }
                },
                Err(e) => e,
            };

            match error {
                RegistrationError::TokenMissing | RegistrationError::TokenInvalid(_) => {
                    tracing::warn!(error = %error, path = %token_file.display(), "Waiting for a new registration token");
                    if !self.wait_for_token_change(&token_file, token).await {
                        return false;
                    }
                }
                RegistrationError::RejectedByManager(_)
                    if last_rejection
                        .as_ref()
                        .is_some_and(|last| last.same_kind(&error)) =>
                {
                    tracing::error!(error = %error, "Registration rejected again, stopping retries");
                    return false;
                }
                RegistrationError::TransportFailure(_) => {
                    tracing::warn!(error = %error, "Registration failed");
                    last_rejection = None;
                    if !self.sleep(jittered(self.context.config.retry_interval)).await {
                        return false;
                    }
                }
                RegistrationError::RejectedByManager(_) => {
                    tracing::warn!(error = %error, "Registration rejected");
                    last_rejection = Some(error);
                    if !self.sleep(jittered(self.context.config.retry_interval)).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Poll the token file until its content differs from `previous`.
    async fn wait_for_token_change(&self, path: &Path, previous: Option<String>) -> bool {
        let interval = self.context.config.token_poll_interval();
        loop {
            if !self.sleep(interval).await {
                return false;
            }
            if identity::read_token(path).await != previous {
                tracing::info!(path = %path.display(), "Registration token changed");
                return true;
            }
        }
    }

    async fn connect_and_serve(&self) -> SessionEnd {
        let identity = match identity::load_identity(&self.context.identity_file()).await {
            Ok(Some(identity)) => identity,
            Ok(None) => return SessionEnd::Unregistered,
            Err(e) => {
                tracing::error!(error = %e, "Cannot load device identity");
                return SessionEnd::Failed(ConnectionError::LocalTransport(e.to_string()));
            }
        };

        let url = identity.session_url(&self.context.config.transport, &self.device_id);
        let marker = self.context.failure_marker_file();
        let user_agent = self.context.user_agent();
        let connected = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Stopped,
            result = self.connector.connect(&url, &user_agent) => result,
        };

        match connected {
            Ok(channel) => {
                identity::clear_failure(&marker).await;
                self.set_state(EngineState::Connected);
                tracing::info!(server = %identity.server, "Connected to manager");
                self.serve(channel).await
            }
            Err(e) => {
                tracing::error!(server = %identity.server, error = %e, "Connection failed");
                identity::mark_failure(&marker, &e.to_string()).await;
                SessionEnd::Failed(e)
            }
        }
    }

    async fn serve(&self, mut channel: Box<dyn Channel>) -> SessionEnd {
        if let Err(e) = self.flush_pending(channel.as_mut()).await {
            channel.close().await;
            return SessionEnd::Failed(e.into());
        }

        let session = self.cancel.child_token();
        let seen = Arc::new(AtomicBool::new(true));
        let watchdog = tokio::spawn(heartbeat(
            self.context.config.heartbeat_interval(),
            Arc::clone(&seen),
            self.executor.stats().cloned(),
            session.clone(),
        ));

        let end = loop {
            let text = tokio::select! {
                () = session.cancelled() => {
                    break if self.cancel.is_cancelled() {
                        SessionEnd::Stopped
                    } else {
                        SessionEnd::HeartbeatExpired
                    };
                }
                msg = channel.recv() => match msg {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => break SessionEnd::Failed(e.into()),
                    None => break SessionEnd::RemoteClosed,
                },
            };

            seen.store(true, Ordering::Relaxed);
            let Some((reply, reconnect)) = self.handle(&text).await else {
                continue;
            };

            // The reply may not make it over a session whose network is
            // being reconfigured; keep it for the next one.
            if reconnect {
                tracing::info!("Device changed, reopening session");
                self.pending.push(reply);
                break SessionEnd::Failed(ConnectionError::DeviceChangeInitiated);
            }
            if let Err(e) = channel.send(reply.to_text()).await {
                break SessionEnd::Failed(e.into());
            }
        };

        session.cancel();
        channel.close().await;
        if let Err(e) = watchdog.await {
            tracing::warn!(error = %e, "Heartbeat task failed");
        }
        tracing::info!("Session closed");
        end
    }

    async fn flush_pending(&self, channel: &mut dyn Channel) -> Result<(), ChannelError> {
        let count = self.pending.len();
        if count > 0 {
            tracing::info!(count, "Sending pending replies");
        }
        while let Some(frame) = self.pending.front() {
            channel.send(frame.to_text()).await?;
            self.pending.pop_front();
        }
        Ok(())
    }

    /// Execute one inbound frame. Returns the reply and whether the
    /// session must be reopened.
    async fn handle(&self, text: &str) -> Option<(OutboundFrame, bool)> {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed frame");
                return None;
            }
        };

        let request = frame.msg.to_request();
        tracing::debug!(seq = %frame.seq, request = %request.message, "Request received");
        let reply = self.executor.execute(&request).await;
        let reconnect = request.wants_reconnect();

        Some((
            OutboundFrame::reply(frame.seq, frame.msg.entity.as_deref(), reply),
            reconnect,
        ))
    }
}

/// Cancel `session` once a full period passes without a request.
///
/// Every tick also samples the device statistics.
async fn heartbeat(
    period: Duration,
    seen: Arc<AtomicBool>,
    stats: Option<Arc<DeviceStats>>,
    session: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            () = session.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Some(stats) = &stats {
            stats.update().await;
        }
        if !seen.swap(false, Ordering::Relaxed) {
            tracing::debug!(secs = period.as_secs(), "No request within heartbeat interval, dropping session");
            session.cancel();
            return;
        }
    }
}

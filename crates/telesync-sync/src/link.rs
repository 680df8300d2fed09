//! # Broker Link
//!
//! One physical broker connection with automatic reconnection.
//!
//! ## Connection State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Broker Link State Machine                            │
//! │                                                                         │
//! │   ┌──────────────┐                                                      │
//! │   │ DISCONNECTED │ ◄─────────────── shutdown (from any state)           │
//! │   └──────┬───────┘                                                      │
//! │          │ spawn()                                                      │
//! │          ▼                                                              │
//! │   ┌──────────────┐   connect + subscribe all + announce online          │
//! │   │  CONNECTING  │ ──────────────────────────────┐                      │
//! │   └──────┬───────┘                               │                      │
//! │          │ failure: backoff, retry               ▼                      │
//! │          └──────────► (stays CONNECTING)  ┌──────────────┐              │
//! │                                           │  CONNECTED   │  publish OK  │
//! │   ┌──────────────┐   re-subscribed        └──────┬───────┘              │
//! │   │ RECONNECTING │ ──────────────────────────────┘▲      │              │
//! │   └──────▲───────┘                                       │ lost         │
//! │          └───────────────────────────────────────────────┘              │
//! │                 full-jitter backoff between attempts, forever           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - `publish` succeeds only in CONNECTED; otherwise `NotConnected` at once
//! - CONNECTED is signalled only after every subscription is confirmed
//! - The link holds no business buffering: a publish lost with the
//!   connection resolves its [`AckToken`] with `NotConnected`
//! - Inbound payloads are decoded once into [`InboundMessage`]; malformed
//!   ones are counted and dropped

use backoff::backoff::Backoff;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use telesync_core::{SourceState, SystemStatus};

use crate::broker::{AckId, BrokerConnector, BrokerSession, SessionEvent};
use crate::config::{BackoffSettings, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::protocol::{self, InboundMessage, TopicKind, Topics};
use crate::status::{DegradedReason, HealthSignal, NoOpEmitter, StatusEmitter};

// =============================================================================
// Connection State
// =============================================================================

/// Current state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not running, or stopped.
    Disconnected,

    /// First connection attempt(s) in progress.
    Connecting,

    /// Connected and subscribed; publish succeeds.
    Connected,

    /// Connection lost, backing off and retrying.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Full Jitter Backoff
// =============================================================================

/// Exponential backoff with full jitter.
///
/// The n-th delay is uniform in `[0, min(cap, base * 2^n)]`.
#[derive(Debug, Clone)]
pub struct FullJitterBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl FullJitterBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        FullJitterBackoff {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(settings.initial(), settings.max())
    }

    /// Upper bound of the next delay.
    pub fn ceiling(&self) -> Duration {
        1u32.checked_shl(self.attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Backoff for FullJitterBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Some(Duration::from_millis(millis))
    }
}

// =============================================================================
// Link Configuration
// =============================================================================

/// Configuration for one broker link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Name used in logs ("edge", "center").
    pub name: String,

    pub topics: Topics,

    /// Topic kinds subscribed on every (re)connect.
    pub subscriptions: Vec<TopicKind>,

    /// If set, publish `online` as this source after every connect and
    /// `offline` before a clean shutdown.
    pub announce_as: Option<String>,

    /// Bound on connect and on the whole subscribe phase.
    pub connect_timeout: Duration,

    /// Consecutive failed attempts before reporting degraded (0 = never).
    pub degraded_after_attempts: u32,

    /// Capacity of the inbound message queue.
    pub inbound_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            name: "link".into(),
            topics: Topics::default(),
            subscriptions: Vec::new(),
            announce_as: None,
            connect_timeout: Duration::from_secs(10),
            degraded_after_attempts: 20,
            inbound_capacity: 1024,
        }
    }
}

impl LinkConfig {
    /// Edge side: receives credential updates, announces the device.
    pub fn edge(config: &SyncConfig) -> Self {
        LinkConfig {
            name: "edge".into(),
            topics: Topics::new(&config.broker.topic_prefix),
            subscriptions: vec![TopicKind::CredentialSync],
            announce_as: Some(config.device_id().to_string()),
            connect_timeout: config.broker.connect_timeout(),
            degraded_after_attempts: config.backoff.degraded_after_attempts,
            ..Default::default()
        }
    }

    /// Central side: receives telemetry and presence.
    pub fn center(config: &SyncConfig) -> Self {
        LinkConfig {
            name: "center".into(),
            topics: Topics::new(&config.broker.topic_prefix),
            subscriptions: vec![TopicKind::Telemetry, TopicKind::SystemStatus],
            announce_as: None,
            connect_timeout: config.broker.connect_timeout(),
            degraded_after_attempts: config.backoff.degraded_after_attempts,
            ..Default::default()
        }
    }
}

// =============================================================================
// Ack Token
// =============================================================================

/// Resolves when the broker acknowledges one publish.
#[derive(Debug)]
pub struct AckToken {
    rx: oneshot::Receiver<SyncResult<()>>,
}

impl AckToken {
    /// Waits for the broker acknowledgment.
    ///
    /// A timed-out token can be waited on again; do not wait after it
    /// has resolved.
    ///
    /// ## Errors
    /// - `PublishTimeout` if no ack arrives within `limit`
    /// - `NotConnected` if the connection drops first
    pub async fn wait(&mut self, limit: Duration) -> SyncResult<()> {
        match timeout(limit, &mut self.rx).await {
            Err(_) => Err(SyncError::PublishTimeout(limit)),
            Ok(Err(_)) => Err(SyncError::NotConnected),
            Ok(Ok(result)) => result,
        }
    }
}

// =============================================================================
// Link Handle
// =============================================================================

enum LinkCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
        ack: oneshot::Sender<SyncResult<()>>,
    },
}

impl LinkCommand {
    fn reject(self, err: SyncError) {
        match self {
            LinkCommand::Publish { ack, .. } => {
                let _ = ack.send(Err(err));
            }
        }
    }
}

/// Handle for interacting with the link from other components.
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
    state: watch::Receiver<ConnectionState>,
    shutdown_tx: mpsc::Sender<()>,
    topics: Topics,
}

impl LinkHandle {
    /// Publishes at QoS 1.
    ///
    /// Fails immediately with `NotConnected` unless the link is CONNECTED.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Vec<u8>,
        retain: bool,
    ) -> SyncResult<AckToken> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let (ack, rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Publish {
                topic: topic.into(),
                payload,
                retain,
                ack,
            })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;

        Ok(AckToken { rx })
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Returns true if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Failed to send shutdown signal".into()))
    }

    /// Waits until the link task has exited.
    pub async fn join(&self) {
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
    }
}

// =============================================================================
// Broker Link
// =============================================================================

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Broker connection with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let connector = Arc::new(MqttConnector::from_config(&config, Some(will))?);
/// let (link, mut inbound) = BrokerLink::new(connector, LinkConfig::edge(&config))
///     .with_backoff(FullJitterBackoff::from_settings(&config.backoff))
///     .with_metrics(metrics.clone())
///     .spawn();
///
/// while let Some(msg) = inbound.recv().await {
///     println!("Received: {:?}", msg.kind());
/// }
/// ```
pub struct BrokerLink {
    connector: Arc<dyn BrokerConnector>,
    config: LinkConfig,
    backoff: Box<dyn Backoff + Send>,
    metrics: Arc<SyncMetrics>,
    emitter: Arc<dyn StatusEmitter>,
}

impl BrokerLink {
    pub fn new(connector: Arc<dyn BrokerConnector>, config: LinkConfig) -> Self {
        BrokerLink {
            connector,
            config,
            backoff: Box::new(FullJitterBackoff::new(
                Duration::from_millis(500),
                Duration::from_secs(60),
            )),
            metrics: Arc::new(SyncMetrics::new()),
            emitter: Arc::new(NoOpEmitter),
        }
    }

    /// Replaces the reconnect backoff strategy.
    pub fn with_backoff(mut self, backoff: impl Backoff + Send + 'static) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn StatusEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Spawns the connection task.
    ///
    /// Returns a handle and the inbound message stream.
    pub fn spawn(self) -> (LinkHandle, mpsc::Receiver<InboundMessage>) {
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let handle = LinkHandle {
            commands: commands_tx,
            state: state_rx,
            shutdown_tx,
            topics: self.config.topics.clone(),
        };

        let task = LinkTask {
            connector: self.connector,
            config: self.config,
            backoff: self.backoff,
            metrics: self.metrics,
            emitter: self.emitter,
            state: state_tx,
            commands: commands_rx,
            inbound: inbound_tx,
            shutdown_rx,
        };
        tokio::spawn(task.run());

        (handle, inbound_rx)
    }
}

struct LinkTask {
    connector: Arc<dyn BrokerConnector>,
    config: LinkConfig,
    backoff: Box<dyn Backoff + Send>,
    metrics: Arc<SyncMetrics>,
    emitter: Arc<dyn StatusEmitter>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::Receiver<LinkCommand>,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl LinkTask {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(link = %self.config.name, from = %previous, to = %state, "Link state changed");
        }
    }

    /// Main link loop.
    async fn run(mut self) {
        info!(link = %self.config.name, "Broker link starting");

        let mut failures = 0u32;
        let mut ever_connected = false;

        'link: loop {
            self.set_state(if ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            // Try to connect; publishes meanwhile are refused, not queued
            let result = {
                let attempt = establish(self.connector.as_ref(), &self.config);
                tokio::pin!(attempt);
                loop {
                    tokio::select! {
                        result = &mut attempt => break result,
                        _ = self.shutdown_rx.recv() => {
                            info!(link = %self.config.name, "Shutdown during connect");
                            break 'link;
                        }
                        Some(cmd) = self.commands.recv() => cmd.reject(SyncError::NotConnected),
                    }
                }
            };

            match result {
                Ok(session) => {
                    if ever_connected {
                        self.metrics.add_reconnects(1);
                    }
                    ever_connected = true;
                    failures = 0;
                    self.backoff.reset();
                    self.emitter.emit_health(&HealthSignal::Healthy);
                    self.set_state(ConnectionState::Connected);

                    match self.connection_loop(session).await {
                        SessionEnd::Shutdown => break 'link,
                        SessionEnd::Lost(reason) => {
                            warn!(link = %self.config.name, reason = %reason, "Connection lost");
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    error!(link = %self.config.name, error = %e, attempt = failures, "Failed to connect");

                    let ceiling = self.config.degraded_after_attempts;
                    if ceiling > 0 && failures == ceiling {
                        self.emitter
                            .emit_health(&HealthSignal::Degraded(DegradedReason::ReconnectCeiling));
                    }
                }
            }

            // Wait for backoff duration
            let delay = self.backoff.next_backoff().unwrap_or(Duration::from_secs(60));
            debug!(link = %self.config.name, ?delay, "Waiting before reconnect");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = self.shutdown_rx.recv() => {
                        info!(link = %self.config.name, "Shutdown during backoff");
                        break 'link;
                    }
                    Some(cmd) = self.commands.recv() => cmd.reject(SyncError::NotConnected),
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(link = %self.config.name, "Broker link stopped");
    }

    /// Serves one live session until it is lost or shutdown is requested.
    async fn connection_loop(&mut self, mut session: Box<dyn BrokerSession>) -> SessionEnd {
        let mut awaiting: HashMap<AckId, oneshot::Sender<SyncResult<()>>> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(link = %self.config.name, "Shutdown signal received, closing connection");
                    if let Some(source) = &self.config.announce_as {
                        if let Ok(payload) =
                            protocol::encode(&SystemStatus::now(source.clone(), SourceState::Offline))
                        {
                            let topic = self.config.topics.status_for(source);
                            let _ = session.publish(&topic, payload, true).await;
                        }
                    }
                    session.disconnect().await;
                    // Pending acks resolve to NotConnected as `awaiting` drops
                    return SessionEnd::Shutdown;
                }

                Some(cmd) = self.commands.recv() => match cmd {
                    LinkCommand::Publish { topic, payload, retain, ack } => {
                        match session.publish(&topic, payload, retain).await {
                            Ok(id) => {
                                debug!(link = %self.config.name, topic = %topic, ack_id = id, "Published");
                                awaiting.insert(id, ack);
                            }
                            Err(e) => {
                                let _ = ack.send(Err(e));
                            }
                        }
                    }
                },

                event = session.next_event() => match event {
                    SessionEvent::Message { topic, payload } => {
                        self.deliver(&topic, &payload).await;
                    }
                    SessionEvent::Acked(id) => {
                        if let Some(ack) = awaiting.remove(&id) {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    SessionEvent::Disconnected(reason) => return SessionEnd::Lost(reason),
                },
            }
        }
    }

    async fn deliver(&mut self, topic: &str, payload: &[u8]) {
        match protocol::decode(&self.config.topics, topic, payload) {
            Ok(msg) => {
                debug!(link = %self.config.name, topic = %topic, "Received message");
                if self.inbound.send(msg).await.is_err() {
                    debug!(link = %self.config.name, "Inbound receiver dropped");
                }
            }
            Err(e) => {
                self.metrics.add_malformed_messages(1);
                warn!(link = %self.config.name, topic = %topic, error = %e, "Dropping malformed message");
            }
        }
    }
}

/// Connects, subscribes every configured topic and announces presence.
async fn establish(
    connector: &dyn BrokerConnector,
    config: &LinkConfig,
) -> SyncResult<Box<dyn BrokerSession>> {
    let setup = async {
        let mut session = connector.connect().await?;

        for kind in &config.subscriptions {
            session.subscribe(&config.topics.filter(*kind)).await?;
        }

        if let Some(source) = &config.announce_as {
            let status = SystemStatus::now(source.clone(), SourceState::Online);
            session
                .publish(&config.topics.status_for(source), protocol::encode(&status)?, true)
                .await?;
        }

        Ok::<_, SyncError>(session)
    };

    timeout(config.connect_timeout, setup)
        .await
        .map_err(|_| SyncError::Timeout(config.connect_timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeBroker;
    use crate::status::testing::RecordingEmitter;
    use backoff::backoff::Constant;
    use telesync_core::{CredentialRecord, TelemetryEvent, TelemetryValue};

    fn edge_config() -> LinkConfig {
        LinkConfig {
            name: "test".into(),
            subscriptions: vec![TopicKind::CredentialSync],
            announce_as: Some("D1".into()),
            degraded_after_attempts: 3,
            ..Default::default()
        }
    }

    fn spawn(broker: &FakeBroker, config: LinkConfig) -> (LinkHandle, mpsc::Receiver<InboundMessage>) {
        BrokerLink::new(broker.connector(), config)
            .with_backoff(Constant::new(Duration::from_millis(100)))
            .spawn()
    }

    async fn connected(handle: &LinkHandle) {
        handle
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[test]
    fn test_full_jitter_bounds() {
        let mut backoff = FullJitterBackoff::new(Duration::from_millis(500), Duration::from_secs(4));
        let ceilings = [500, 1000, 2000, 4000, 4000, 4000];
        for ceiling in ceilings {
            assert_eq!(backoff.ceiling(), Duration::from_millis(ceiling));
            let delay = backoff.next_backoff().unwrap();
            assert!(delay <= Duration::from_millis(ceiling));
        }

        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_millis(500));

        // Far past the shift width the cap still holds
        backoff.attempt = 40;
        assert_eq!(backoff.ceiling(), Duration::from_secs(4));
    }

    #[test]
    fn test_link_task_future_is_send() {
        fn assert_send<T: Send>(_: T) {}

        let broker = FakeBroker::new();
        let (_commands_tx, commands) = mpsc::channel(1);
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state, _state_rx) = watch::channel(ConnectionState::Disconnected);

        let task = LinkTask {
            connector: broker.connector(),
            config: edge_config(),
            backoff: Box::new(Constant::new(Duration::from_millis(100))),
            metrics: Arc::new(SyncMetrics::new()),
            emitter: Arc::new(NoOpEmitter),
            state,
            commands,
            inbound,
            shutdown_rx,
        };
        assert_send(task.run());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_and_announces_before_connected() {
        let broker = FakeBroker::new();
        let (handle, _inbound) = spawn(&broker, edge_config());
        connected(&handle).await;

        assert_eq!(broker.subscriptions(), vec!["users/sync/#".to_string()]);
        let online: SystemStatus =
            serde_json::from_slice(&broker.retained("system/status/D1").unwrap()).unwrap();
        assert_eq!(online.state, SourceState::Online);

        handle.shutdown().await.unwrap();
        handle.join().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        let offline: SystemStatus =
            serde_json::from_slice(&broker.retained("system/status/D1").unwrap()).unwrap();
        assert_eq!(offline.state, SourceState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_fails_fast_when_not_connected() {
        let broker = FakeBroker::new();
        broker.set_online(false);
        let (handle, _inbound) = spawn(&broker, edge_config());

        let err = handle.publish("telemetry/data", b"{}".to_vec(), false).await.unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
        assert!(broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_token_outcomes() {
        let broker = FakeBroker::new();
        let (handle, _inbound) = spawn(&broker, edge_config());
        connected(&handle).await;

        let mut token = handle.publish("telemetry/data", b"1".to_vec(), false).await.unwrap();
        assert!(token.wait(Duration::from_secs(1)).await.is_ok());

        broker.set_auto_ack(false);
        let mut token = handle.publish("telemetry/data", b"2".to_vec(), false).await.unwrap();
        let err = token.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::PublishTimeout(_)));

        let mut token = handle.publish("telemetry/data", b"3".to_vec(), false).await.unwrap();
        // Let the link hand the publish to the session before cutting it
        tokio::time::sleep(Duration::from_millis(1)).await;
        broker.drop_connections();
        let err = token.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_resubscribes() {
        let broker = FakeBroker::new();
        let metrics = Arc::new(SyncMetrics::new());
        let (handle, _inbound) = BrokerLink::new(broker.connector(), edge_config())
            .with_backoff(Constant::new(Duration::from_millis(100)))
            .with_metrics(metrics.clone())
            .spawn();
        connected(&handle).await;

        let mut states = handle.watch_state();
        broker.drop_connections();
        states
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        connected(&handle).await;

        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.subscriptions(), vec!["users/sync/#".to_string()]);
        assert_eq!(metrics.snapshot().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_degraded_after_ceiling() {
        let broker = FakeBroker::new();
        broker.set_online(false);
        let emitter = Arc::new(RecordingEmitter::default());
        let (handle, _inbound) = BrokerLink::new(broker.connector(), edge_config())
            .with_backoff(Constant::new(Duration::from_millis(100)))
            .with_emitter(emitter.clone())
            .spawn();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(
            emitter.health(),
            vec![HealthSignal::Degraded(DegradedReason::ReconnectCeiling)]
        );
        assert_eq!(handle.state(), ConnectionState::Connecting);

        broker.set_online(true);
        connected(&handle).await;
        assert_eq!(emitter.health().last(), Some(&HealthSignal::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_decoded_and_malformed_dropped() {
        let broker = FakeBroker::new();
        let metrics = Arc::new(SyncMetrics::new());
        let (handle, mut inbound) = BrokerLink::new(broker.connector(), edge_config())
            .with_metrics(metrics.clone())
            .spawn();
        connected(&handle).await;

        broker.inject("users/sync/7", b"{garbage", false);
        let record = CredentialRecord::tombstone(7, 2);
        broker.inject("users/sync/7", &serde_json::to_vec(&record).unwrap(), false);

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg, InboundMessage::Credential(record));
        assert_eq!(metrics.snapshot().malformed_messages, 1);

        // Not subscribed: never reaches this link
        let event = TelemetryEvent::new("D1", 1, TelemetryValue::Int(1));
        broker.inject("telemetry/data", &serde_json::to_vec(&event).unwrap(), false);
        assert!(inbound.try_recv().is_err());
    }
}

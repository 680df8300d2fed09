//! # Sync Agent
//!
//! Edge-side orchestrator. Owns the broker link, the publish pipeline and
//! the credential sync engine, and keeps the connectivity indicator.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │   capture(device, value)                                                │
//! │        │ append only, never waits on the network                        │
//! │        ▼                                                                │
//! │  ┌────────────────┐  wake   ┌────────────────┐ publish ┌─────────────┐  │
//! │  │ BufferRepository├───────►│PublishPipeline ├────────►│ BrokerLink  │  │
//! │  │ (SQLite, WAL)  │◄────────┤ ack / requeue  │◄────────┤ (MQTT)      │  │
//! │  └────────────────┘         └────────────────┘  acks   └──────┬──────┘  │
//! │                                                               │ inbound │
//! │                                                               ▼         │
//! │                                                 ┌──────────────────────┐│
//! │                                                 │ CredentialSyncEngine ││
//! │                                                 └──────────────────────┘│
//! │                                                                         │
//! │  SUPERVISOR (status tick and link state changes):                       │
//! │  • refreshes SyncStatus {state, pending, in_flight, evicted, health}    │
//! │  • Degraded(BufferOverflow) after N ticks with new evictions            │
//! │  • ordered shutdown: pipeline, credential engine, link                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use telesync_core::validation::validate_device_id;
use telesync_core::{SourceState, SystemStatus, TelemetryEvent, TelemetryValue};
use telesync_db::{Database, DbError};

use crate::broker::{BrokerConnector, MqttConnector, Will};
use crate::config::SyncConfig;
use crate::credentials::{CredentialChange, CredentialHandle, CredentialSyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::link::{BrokerLink, ConnectionState, FullJitterBackoff, LinkConfig, LinkHandle};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::protocol::{self, Topics};
use crate::publisher::{PipelineHandle, PublishPipeline};
use crate::status::{DegradedReason, HealthSignal, NoOpEmitter, StatusEmitter, SyncStatus};

/// Default period of the status tick.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Overflow Tracking
// =============================================================================

/// Turns the eviction counter into a sustained-overflow health signal.
#[derive(Debug)]
struct OverflowTracker {
    /// Consecutive growing ticks before degrading (0 = never).
    threshold: u32,
    last_total: u64,
    streak: u32,
    degraded: bool,
}

impl OverflowTracker {
    fn new(threshold: u32, current_total: u64) -> Self {
        OverflowTracker {
            threshold,
            last_total: current_total,
            streak: 0,
            degraded: false,
        }
    }

    /// Feeds one tick; returns a signal when health flips.
    fn observe(&mut self, evicted_total: u64) -> Option<HealthSignal> {
        let grew = evicted_total > self.last_total;
        self.last_total = evicted_total;

        if grew {
            self.streak = self.streak.saturating_add(1);
            if self.threshold > 0 && !self.degraded && self.streak >= self.threshold {
                self.degraded = true;
                return Some(HealthSignal::Degraded(DegradedReason::BufferOverflow));
            }
        } else {
            self.streak = 0;
            if self.degraded {
                self.degraded = false;
                return Some(HealthSignal::Healthy);
            }
        }
        None
    }
}

/// Forwards link notifications and remembers whether the link is degraded.
struct LinkHealthTap {
    inner: Arc<dyn StatusEmitter>,
    degraded: Arc<AtomicBool>,
}

impl StatusEmitter for LinkHealthTap {
    fn emit_status(&self, status: &SyncStatus) {
        self.inner.emit_status(status);
    }

    fn emit_health(&self, signal: &HealthSignal) {
        self.degraded.store(signal.is_degraded(), Ordering::Relaxed);
        self.inner.emit_health(signal);
    }

    fn emit_credential_change(&self, change: &CredentialChange) {
        self.inner.emit_credential_change(change);
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Edge sync agent. Build with [`SyncAgentBuilder`], then [`start`](Self::start).
pub struct SyncAgent {
    config: Arc<SyncConfig>,
    db: Database,
    connector: Arc<dyn BrokerConnector>,
    emitter: Arc<dyn StatusEmitter>,
    metrics: Arc<SyncMetrics>,
    status_interval: Duration,
}

impl SyncAgent {
    /// Starts every component and returns a handle.
    ///
    /// Records left IN_FLIGHT by a previous run are requeued first; their
    /// delivery was never confirmed.
    pub async fn start(self) -> SyncResult<SyncAgentHandle> {
        self.config.validate()?;

        info!(
            device_id = %self.config.device_id(),
            broker = %self.config.broker.url,
            "Starting sync agent"
        );

        let buffer = self.db.buffer();
        let recovered = buffer.recover_in_flight().await?;
        if recovered > 0 {
            warn!(count = recovered, "Requeued records left in flight by the previous run");
        }

        let link_degraded = Arc::new(AtomicBool::new(false));
        let tap = Arc::new(LinkHealthTap {
            inner: self.emitter.clone(),
            degraded: link_degraded.clone(),
        });
        let (link, inbound) = BrokerLink::new(self.connector, LinkConfig::edge(&self.config))
            .with_backoff(FullJitterBackoff::from_settings(&self.config.backoff))
            .with_metrics(self.metrics.clone())
            .with_emitter(tap)
            .spawn();

        let (pipeline, pipeline_handle) = PublishPipeline::new(
            buffer.clone(),
            link.clone(),
            self.config.publish.clone(),
            self.config.backoff.clone(),
            self.metrics.clone(),
        );
        let pipeline_task = tokio::spawn(pipeline.run());

        let (engine, credentials) = CredentialSyncEngine::new(
            self.db.credentials(),
            inbound,
            self.emitter.clone(),
            self.metrics.clone(),
        );
        let engine_task = tokio::spawn(engine.run());

        let status = Arc::new(RwLock::new(SyncStatus::default()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let supervisor = Supervisor {
            buffer: buffer.clone(),
            link: link.clone(),
            pipeline: pipeline_handle.clone(),
            pipeline_task,
            credentials: credentials.clone(),
            engine_task,
            status: status.clone(),
            emitter: self.emitter,
            link_degraded,
            overflow: OverflowTracker::new(
                self.config.buffer.degraded_after_eviction_ticks,
                buffer.evicted_total(),
            ),
            interval: self.status_interval,
            shutdown_rx,
            stopped_tx,
        };
        tokio::spawn(supervisor.run());

        info!("Sync agent started");

        Ok(SyncAgentHandle {
            shutdown_tx,
            stopped: stopped_rx,
            status,
            buffer,
            topics: link.topics().clone(),
            pipeline: pipeline_handle,
            credentials,
            metrics: self.metrics,
        })
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Supervisor {
    buffer: telesync_db::BufferRepository,
    link: LinkHandle,
    pipeline: PipelineHandle,
    pipeline_task: JoinHandle<()>,
    credentials: CredentialHandle,
    engine_task: JoinHandle<()>,
    status: Arc<RwLock<SyncStatus>>,
    emitter: Arc<dyn StatusEmitter>,
    link_degraded: Arc<AtomicBool>,
    overflow: OverflowTracker,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stopped_tx: watch::Sender<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        let mut states = self.link.watch_state();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Some(signal) = self.overflow.observe(self.buffer.evicted_total()) {
                        self.emitter.emit_health(&signal);
                    }
                    self.refresh().await;
                }

                changed = states.changed() => {
                    if changed.is_err() {
                        error!("Broker link stopped unexpectedly");
                        break;
                    }
                    self.refresh().await;
                }

                _ = self.shutdown_rx.recv() => break,
            }
        }

        self.stop().await;
    }

    fn health(&self) -> HealthSignal {
        if self.overflow.degraded {
            HealthSignal::Degraded(DegradedReason::BufferOverflow)
        } else if self.link_degraded.load(Ordering::Relaxed) {
            HealthSignal::Degraded(DegradedReason::ReconnectCeiling)
        } else {
            HealthSignal::Healthy
        }
    }

    async fn refresh(&self) {
        let mut next = self.status.read().await.clone();
        next.connection_state = self.link.state();
        match self.buffer.depth().await {
            Ok(depth) => {
                next.pending = depth.pending;
                next.in_flight = depth.in_flight;
            }
            Err(e) => warn!(error = %e, "Failed to read buffer depth"),
        }
        next.evicted_total = self.buffer.evicted_total();
        next.health = self.health();
        next.last_error = self.pipeline.last_error().await;

        let changed = {
            let mut status = self.status.write().await;
            let changed = *status != next;
            *status = next.clone();
            changed
        };

        if changed {
            debug!(state = %next.connection_state, pending = next.pending, "Status changed");
            self.emitter.emit_status(&next);
        }
    }

    /// Pipeline first so its in-flight records settle over a live link.
    async fn stop(self) {
        info!("Shutting down sync agent");

        let _ = self.pipeline.shutdown().await;
        if let Err(e) = self.pipeline_task.await {
            error!(error = %e, "Publish pipeline task failed");
        }

        let _ = self.credentials.shutdown().await;
        if let Err(e) = self.engine_task.await {
            error!(error = %e, "Credential engine task failed");
        }

        let _ = self.link.shutdown().await;
        self.link.join().await;

        let final_status = {
            let mut status = self.status.write().await;
            status.connection_state = ConnectionState::Disconnected;
            if let Ok(depth) = self.buffer.depth().await {
                status.pending = depth.pending;
                status.in_flight = depth.in_flight;
            }
            status.clone()
        };
        self.emitter.emit_status(&final_status);

        let _ = self.stopped_tx.send(true);
        info!("Sync agent stopped");
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running [`SyncAgent`].
#[derive(Clone)]
pub struct SyncAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
    stopped: watch::Receiver<bool>,
    status: Arc<RwLock<SyncStatus>>,
    buffer: telesync_db::BufferRepository,
    topics: Topics,
    pipeline: PipelineHandle,
    credentials: CredentialHandle,
    metrics: Arc<SyncMetrics>,
}

impl SyncAgentHandle {
    /// Current connectivity / sync indicator.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Buffers one reading. Never waits on the network.
    ///
    /// ## Errors
    /// - [`SyncError::BufferFull`] if every retained record is in flight;
    ///   the reading is dropped and counted as an eviction
    pub async fn capture(
        &self,
        device_id: &str,
        value: TelemetryValue,
    ) -> SyncResult<TelemetryEvent> {
        validate_device_id(device_id)
            .map_err(|e| SyncError::malformed(self.topics.telemetry(), e))?;

        match self.buffer.capture(device_id, value).await {
            Ok((event, receipt)) => {
                if !receipt.evicted.is_empty() {
                    self.metrics.add_evictions(receipt.evicted.len() as u64);
                }
                self.pipeline.wake();
                Ok(event)
            }
            Err(DbError::InvalidRecord(e)) => Err(SyncError::malformed(self.topics.telemetry(), e)),
            Err(DbError::BufferFull { capacity }) => {
                self.metrics.add_evictions(1);
                Err(SyncError::BufferFull { capacity })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Local credentials for login logic.
    pub fn credentials(&self) -> &CredentialHandle {
        &self.credentials
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stops the agent and waits until every component has exited.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|done| *done).await;
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a [`SyncAgent`].
pub struct SyncAgentBuilder {
    config: SyncConfig,
    db: Option<Database>,
    connector: Option<Arc<dyn BrokerConnector>>,
    emitter: Option<Arc<dyn StatusEmitter>>,
    metrics: Option<Arc<SyncMetrics>>,
    status_interval: Duration,
}

impl SyncAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            db: None,
            connector: None,
            emitter: None,
            metrics: None,
            status_interval: STATUS_INTERVAL,
        }
    }

    /// Sets the database holding the buffer and the local credentials.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Overrides the MQTT connector built from `[broker]`.
    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn StatusEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Builds the agent.
    ///
    /// Without an explicit connector, an MQTT connector is created whose
    /// last will announces this device `offline`.
    pub fn build(self) -> SyncResult<SyncAgent> {
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                let topics = Topics::new(&self.config.broker.topic_prefix);
                let offline = SystemStatus::now(self.config.device_id(), SourceState::Offline);
                let will = Will {
                    topic: topics.status_for(self.config.device_id()),
                    payload: protocol::encode(&offline)?,
                    retain: true,
                };
                Arc::new(MqttConnector::from_config(&self.config, Some(will))?)
            }
        };

        Ok(SyncAgent {
            config: Arc::new(self.config),
            db,
            connector,
            emitter: self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
            metrics: self.metrics.unwrap_or_default(),
            status_interval: self.status_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeBroker;
    use crate::status::testing::RecordingEmitter;
    use telesync_db::DbConfig;

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.device.id = "edge-1".into();
        config.broker.url = "mqtt://localhost:1883".into();
        config.backoff.initial_ms = 10;
        config.backoff.max_ms = 50;
        config.publish.poll_interval_ms = 20;
        config.publish.ack_timeout_ms = 500;
        config.publish.shutdown_grace_ms = 100;
        config.buffer.degraded_after_eviction_ticks = 2;
        config
    }

    async fn start(
        broker: &FakeBroker,
        db: Database,
        emitter: Arc<RecordingEmitter>,
    ) -> SyncAgentHandle {
        SyncAgentBuilder::new(test_config())
            .with_database(db)
            .with_connector(broker.connector())
            .with_emitter(emitter)
            .with_status_interval(Duration::from_millis(20))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    macro_rules! eventually {
        ($cond:expr) => {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !$cond {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("condition not reached")
        };
    }

    #[test]
    fn test_overflow_tracker() {
        let mut tracker = OverflowTracker::new(2, 0);
        assert_eq!(tracker.observe(1), None);
        assert_eq!(
            tracker.observe(3),
            Some(HealthSignal::Degraded(DegradedReason::BufferOverflow))
        );
        assert_eq!(tracker.observe(5), None);
        assert_eq!(tracker.observe(5), Some(HealthSignal::Healthy));

        // Interrupted growth starts over
        assert_eq!(tracker.observe(6), None);
        assert_eq!(tracker.observe(6), None);
        assert_eq!(tracker.observe(7), None);

        let mut never = OverflowTracker::new(0, 0);
        for total in 1..10 {
            assert_eq!(never.observe(total), None);
        }
    }

    #[tokio::test]
    async fn test_build_requires_database() {
        let result = SyncAgentBuilder::new(test_config()).build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_offline_capture_delivered_after_connect() {
        let broker = FakeBroker::new();
        broker.set_online(false);
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = start(&broker, db, emitter.clone()).await;

        for i in 0..5 {
            agent.capture("sensor-1", TelemetryValue::Int(i)).await.unwrap();
        }
        eventually!(agent.status().await.pending == 5);
        assert!(!agent.status().await.is_connected());

        broker.set_online(true);
        eventually!(broker.published_on("telemetry/data").len() == 5);
        eventually!({
            let status = agent.status().await;
            status.is_connected() && status.pending == 0 && status.in_flight == 0
        });

        let sequences: Vec<u64> = broker
            .published_on("telemetry/data")
            .iter()
            .map(|p| serde_json::from_slice::<TelemetryEvent>(&p.payload).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert!(emitter.statuses().iter().any(|s| s.is_connected()));

        agent.shutdown().await;
        assert_eq!(agent.status().await.connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_capture_rejects_invalid_device() {
        let broker = FakeBroker::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let agent = start(&broker, db, Arc::new(RecordingEmitter::default())).await;

        let err = agent.capture("bad/device", TelemetryValue::Bool(true)).await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage { .. }));
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_finite_reading_rejected_and_queue_keeps_flowing() {
        let broker = FakeBroker::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let agent = start(&broker, db, Arc::new(RecordingEmitter::default())).await;

        let err = agent
            .capture("sensor-1", TelemetryValue::Float(f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage { .. }));

        let event = agent.capture("sensor-1", TelemetryValue::Float(1.5)).await.unwrap();
        assert_eq!(event.sequence, 1);
        eventually!(broker.published_on("telemetry/data").len() == 1);
        eventually!(agent.status().await.pending == 0 && agent.status().await.in_flight == 0);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_sustained_eviction_degrades_then_recovers() {
        let broker = FakeBroker::new();
        broker.set_online(false);
        let db = Database::new(DbConfig::in_memory().buffer_capacity(2)).await.unwrap();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = start(&broker, db, emitter.clone()).await;

        let overflow = HealthSignal::Degraded(DegradedReason::BufferOverflow);
        let mut i = 0;
        eventually!({
            agent.capture("sensor-1", TelemetryValue::Int(i)).await.unwrap();
            i += 1;
            emitter.health().contains(&overflow)
        });

        let status = agent.status().await;
        assert!(status.evicted_total > 0);
        assert_eq!(status.pending, 2);
        assert!(agent.metrics().evictions > 0);

        // Captures stop: the next quiet tick restores health
        eventually!(emitter.health().last() == Some(&HealthSignal::Healthy));
        eventually!(agent.status().await.health == HealthSignal::Healthy);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_requeues_in_flight_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            let buffer = db.buffer();
            for i in 0..3 {
                buffer.capture("sensor-1", TelemetryValue::Int(i)).await.unwrap();
            }
            // Crash while the batch was unacknowledged
            assert_eq!(buffer.mark_in_flight(10).await.unwrap().len(), 3);
            db.close().await;
        }

        let broker = FakeBroker::new();
        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let agent = start(&broker, db.clone(), Arc::new(RecordingEmitter::default())).await;

        eventually!(broker.published_on("telemetry/data").len() == 3);
        eventually!(db.buffer().depth().await.unwrap().total() == 0);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_requeues_unacknowledged() {
        let broker = FakeBroker::new();
        broker.set_auto_ack(false);
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let agent = start(&broker, db.clone(), Arc::new(RecordingEmitter::default())).await;

        agent.capture("sensor-1", TelemetryValue::Float(1.5)).await.unwrap();
        eventually!(broker.published_on("telemetry/data").len() == 1);

        agent.shutdown().await;
        let depth = db.buffer().depth().await.unwrap();
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.in_flight, 0);

        let offline: SystemStatus =
            serde_json::from_slice(&broker.retained("system/status/edge-1").unwrap()).unwrap();
        assert_eq!(offline.state, SourceState::Offline);
    }

    #[tokio::test]
    async fn test_credentials_applied_from_broker() {
        let broker = FakeBroker::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = start(&broker, db, emitter.clone()).await;
        eventually!(agent.status().await.is_connected());

        let record = telesync_core::CredentialRecord::live(
            11,
            1,
            telesync_core::CredentialFields {
                username: "hana".into(),
                role: telesync_core::Role::Admin,
                active: true,
                password_hash: "argon".into(),
            },
        );
        broker.inject("users/sync/11", &serde_json::to_vec(&record).unwrap(), true);

        eventually!(agent.credentials().find_by_username("hana").await.unwrap().is_some());
        assert_eq!(emitter.changes().len(), 1);
        agent.shutdown().await;
    }
}

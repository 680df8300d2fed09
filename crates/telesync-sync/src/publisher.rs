//! # Publish Pipeline
//!
//! Drains the durable buffer onto the telemetry topic under a bounded
//! in-flight window.
//!
//! ## Pipeline Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Publish Pipeline Flow                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                    buffered_records                             │    │
//! │  │  PENDING e1(D1,1) e2(D1,2) e3(D2,1) ...                         │    │
//! │  └────────────────────────────┬────────────────────────────────────┘    │
//! │                               │ 1. mark_in_flight(max_in_flight)        │
//! │                               ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                    PublishPipeline                              │    │
//! │  │                                                                 │    │
//! │  │  2. Publish in order; stop at the first failure                 │    │
//! │  │  3. Wait for every AckToken until ack_timeout                   │    │
//! │  │  4. ack(acked)  ──► purged                                      │    │
//! │  │  5. requeue(rest) ──► PENDING, attempts += 1, back off          │    │
//! │  │                                                                 │    │
//! │  │  No new batch is claimed until the previous one is settled.     │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  WAITING:                                                               │
//! │  • link not CONNECTED: wait on the link state watch                     │
//! │  • buffer empty: wait for wake() or poll_interval                       │
//! │  • failed batch: exponential backoff, reset on a clean batch            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shutdown
//! Outstanding acks get `shutdown_grace` to arrive. Whatever is still
//! IN_FLIGHT afterwards is requeued before the task exits.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use telesync_db::BufferRepository;

use crate::config::{BackoffSettings, PublishSettings};
use crate::error::{SyncError, SyncResult};
use crate::link::{AckToken, ConnectionState, LinkHandle};
use crate::metrics::SyncMetrics;
use crate::protocol;

// =============================================================================
// Batch Report
// =============================================================================

/// What happened to one claimed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records moved to IN_FLIGHT for this batch.
    pub claimed: usize,

    /// Records acknowledged and purged.
    pub acked: u64,

    /// Records returned to PENDING.
    pub requeued: u64,

    /// Acks that did not arrive in time.
    pub timed_out: u64,
}

impl BatchReport {
    /// True if every claimed record was acknowledged.
    pub fn is_clean(&self) -> bool {
        self.requeued == 0 && self.acked as usize == self.claimed
    }
}

// =============================================================================
// Pipeline Handle
// =============================================================================

/// Handle for controlling the publish pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    wake: Arc<Notify>,
    shutdown_tx: mpsc::Sender<()>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl PipelineHandle {
    /// Tells the pipeline new events were captured.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// The most recent batch failure, cleared by a clean batch.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }
}

// =============================================================================
// Publish Pipeline
// =============================================================================

/// Single worker moving buffered events to the broker.
pub struct PublishPipeline {
    buffer: BufferRepository,
    link: LinkHandle,
    settings: PublishSettings,
    backoff: BackoffSettings,
    metrics: Arc<SyncMetrics>,
    wake: Arc<Notify>,
    last_error: Arc<RwLock<Option<String>>>,
    shutdown_rx: mpsc::Receiver<()>,
    stopping: bool,
}

impl PublishPipeline {
    /// Creates a new pipeline and returns a handle.
    pub fn new(
        buffer: BufferRepository,
        link: LinkHandle,
        settings: PublishSettings,
        backoff: BackoffSettings,
        metrics: Arc<SyncMetrics>,
    ) -> (Self, PipelineHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let wake = Arc::new(Notify::new());
        let last_error = Arc::new(RwLock::new(None));

        let pipeline = PublishPipeline {
            buffer,
            link,
            settings,
            backoff,
            metrics,
            wake: wake.clone(),
            last_error: last_error.clone(),
            shutdown_rx,
            stopping: false,
        };

        let handle = PipelineHandle {
            wake,
            shutdown_tx,
            last_error,
        };

        (pipeline, handle)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.backoff.initial(),
            max_interval: self.backoff.max(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Runs the pipeline loop.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(
            max_in_flight = self.settings.max_in_flight,
            ack_timeout_ms = self.settings.ack_timeout_ms,
            "Publish pipeline starting"
        );

        let mut backoff = self.create_backoff();
        let mut link_state = self.link.watch_state();

        while !self.stopping {
            if !self.link.is_connected() {
                debug!("Link not connected, waiting");
                tokio::select! {
                    changed = link_state.wait_for(|s| *s == ConnectionState::Connected) => {
                        if changed.is_err() {
                            warn!("Broker link stopped, publish pipeline exiting");
                            break;
                        }
                    }
                    _ = self.shutdown_rx.recv() => break,
                }
                continue;
            }

            let delay = match self.process_batch().await {
                Ok(report) if report.claimed == 0 => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                        _ = self.shutdown_rx.recv() => break,
                    }
                    continue;
                }
                Ok(report) if report.is_clean() => {
                    backoff.reset();
                    *self.last_error.write().await = None;
                    continue;
                }
                Ok(report) => {
                    warn!(
                        claimed = report.claimed,
                        acked = report.acked,
                        requeued = report.requeued,
                        timed_out = report.timed_out,
                        "Batch partially delivered"
                    );
                    backoff.next_backoff()
                }
                Err(e) => {
                    error!(error = %e, "Failed to process batch");
                    *self.last_error.write().await = Some(e.to_string());
                    // This worker is the only owner of IN_FLIGHT records
                    if let Err(e) = self.buffer.recover_in_flight().await {
                        error!(error = %e, "Failed to requeue in-flight records");
                    }
                    backoff.next_backoff()
                }
            };

            if self.stopping {
                break;
            }

            let delay = delay.unwrap_or(self.backoff.max());
            debug!(?delay, "Backing off before next batch");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }

        match self.buffer.recover_in_flight().await {
            Ok(n) if n > 0 => info!(requeued = n, "Requeued in-flight records on shutdown"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to requeue in-flight records on shutdown"),
        }

        info!("Publish pipeline stopped");
    }

    /// Claims, publishes and settles one batch.
    async fn process_batch(&mut self) -> SyncResult<BatchReport> {
        let records = self.buffer.mark_in_flight(self.settings.max_in_flight).await?;
        if records.is_empty() {
            return Ok(BatchReport::default());
        }

        let mut report = BatchReport {
            claimed: records.len(),
            ..Default::default()
        };
        debug!(count = records.len(), "Publishing batch");

        let topic = self.link.topics().telemetry();
        let mut tokens: Vec<(Uuid, AckToken)> = Vec::with_capacity(records.len());
        let mut failed: Vec<Uuid> = Vec::new();
        let mut failure: Option<SyncError> = None;

        for (i, record) in records.iter().enumerate() {
            let published = match protocol::encode(&record.event) {
                Ok(payload) => self.link.publish(topic.as_str(), payload, false).await,
                Err(e) => Err(e),
            };

            match published {
                Ok(token) => tokens.push((record.event.event_id, token)),
                Err(e) => {
                    // Later records of the batch must not overtake this one
                    warn!(
                        event_id = %record.event.event_id,
                        device_id = %record.event.device_id,
                        error = %e,
                        "Publish failed, requeueing rest of batch"
                    );
                    failed.extend(records[i..].iter().map(|r| r.event.event_id));
                    failure = Some(e);
                    break;
                }
            }
        }
        self.metrics.add_published(tokens.len() as u64);

        let mut acked: Vec<Uuid> = Vec::with_capacity(tokens.len());
        let mut deadline = Instant::now() + self.settings.ack_timeout();

        for (event_id, mut token) in tokens {
            let outcome = loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    outcome = token.wait(remaining) => break outcome,
                    _ = self.shutdown_rx.recv(), if !self.stopping => {
                        info!("Shutdown requested, waiting for outstanding acks");
                        self.stopping = true;
                        deadline = deadline.min(Instant::now() + self.settings.shutdown_grace());
                    }
                }
            };

            match outcome {
                Ok(()) => acked.push(event_id),
                Err(SyncError::PublishTimeout(_)) => {
                    report.timed_out += 1;
                    failed.push(event_id);
                }
                Err(e) => {
                    failed.push(event_id);
                    failure.get_or_insert(e);
                }
            }
        }

        if report.timed_out > 0 {
            self.metrics.add_publish_timeouts(report.timed_out);
            warn!(count = report.timed_out, "Acks timed out");
        }

        report.acked = self.buffer.ack(&acked).await?;
        self.metrics.add_acked(report.acked);
        report.requeued = self.buffer.requeue(&failed).await?;

        if let Some(e) = failure {
            *self.last_error.write().await = Some(e.to_string());
        }

        debug!(acked = report.acked, requeued = report.requeued, "Batch settled");
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================

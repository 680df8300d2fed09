//! # Delivery Bridge
//!
//! Central-side fan-out of broker telemetry to real-time subscribers.
//!
//! ## Bridge Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Delivery Bridge                                    │
//! │                                                                         │
//! │  center BrokerLink ── InboundMessage ──►┌───────────────────────────┐   │
//! │                                         │   DeliveryBridge (task)   │   │
//! │                                         │                           │   │
//! │                                         │ Telemetry                 │   │
//! │                                         │   DedupWindow  dup? drop  │   │
//! │                                         │   ReorderBuffer per device│   │
//! │                                         │ Status ──► Presence       │   │
//! │                                         └────────────┬──────────────┘   │
//! │                                                      │ scope filter     │
//! │                      ┌───────────────────────────────┼──────────┐       │
//! │                      ▼                               ▼          ▼       │
//! │              ┌──────────────┐              ┌──────────────┐   ...       │
//! │              │SubscriberQ #1│              │SubscriberQ #2│             │
//! │              │ drop-oldest  │              │ drop-oldest  │             │
//! │              └──────┬───────┘              └──────┬───────┘             │
//! │                     ▼                             ▼                     │
//! │              WebSocket /stream             WebSocket /stream            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pushing to a subscriber queue never waits, so one slow subscriber
//! cannot stall the others or the inbound stream. Nothing is persisted.

mod queue;
mod server;
mod window;

pub use queue::SubscriberQueue;
pub use server::{BridgeServer, BridgeServerHandle};
pub use window::{DedupWindow, ReorderBuffer, Released};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use telesync_core::TelemetryEvent;

use crate::config::BridgeSettings;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::protocol::{BridgeEvent, InboundMessage, SubscriptionScope};

// =============================================================================
// Subscribers
// =============================================================================

struct Subscriber {
    scope: SubscriptionScope,
    queue: Arc<SubscriberQueue>,
}

type Registry = RwLock<HashMap<u64, Subscriber>>;

struct BridgeShared {
    subscribers: Registry,
    next_id: AtomicU64,
    forwarded: AtomicU64,
    queue_capacity: usize,
    metrics: Arc<SyncMetrics>,
}

impl BridgeShared {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.write().unwrap_or_else(|p| p.into_inner())
    }

    fn detach(&self, id: u64) -> bool {
        match self.write().remove(&id) {
            Some(subscriber) => {
                subscriber.queue.close();
                info!(subscriber = id, "Subscriber detached");
                true
            }
            None => false,
        }
    }

    /// Pushes `event` to every subscriber whose scope includes it.
    fn fan_out(&self, event: BridgeEvent) {
        let device = event.device_id().map(str::to_owned);
        let subscribers = self.read();
        let mut delivered = 0usize;

        for (id, subscriber) in subscribers.iter() {
            if let Some(device) = &device {
                if !subscriber.scope.includes(device) {
                    continue;
                }
            }
            let dropped = subscriber.queue.push(event.clone());
            if dropped > 0 {
                self.metrics.add_subscriber_drops(dropped);
                debug!(subscriber = id, "Subscriber queue full, dropped oldest");
            }
            delivered += 1;
        }

        debug!(kind = event.type_name(), subscribers = delivered, "Fanned out event");
    }

    fn close_all(&self) {
        for (_, subscriber) in self.write().drain() {
            subscriber.queue.close();
        }
    }
}

/// One attached real-time subscriber. Dropping it detaches.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    shared: Weak<BridgeShared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event for this subscriber, or `None` once detached or the
    /// bridge has stopped.
    pub async fn recv(&self) -> Option<BridgeEvent> {
        self.queue.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.detach(self.id);
        }
    }
}

// =============================================================================
// Bridge Handle
// =============================================================================

/// Bridge counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub subscribers: usize,
    pub forwarded: u64,
    pub duplicates_dropped: u64,
    pub late_events: u64,
    pub subscriber_drops: u64,
}

/// Handle for attaching subscribers and controlling the bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<BridgeShared>,
    shutdown_tx: mpsc::Sender<()>,
}

impl BridgeHandle {
    /// Attaches a new subscriber with its own bounded queue.
    pub fn attach(&self, scope: SubscriptionScope) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.shared.queue_capacity));

        self.shared.write().insert(
            id,
            Subscriber {
                scope: scope.clone(),
                queue: queue.clone(),
            },
        );
        info!(subscriber = id, ?scope, "Subscriber attached");

        Subscription {
            id,
            queue,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Detaches a subscriber. Returns false if it was not attached.
    pub fn detach(&self, id: u64) -> bool {
        self.shared.detach(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.read().len()
    }

    pub fn stats(&self) -> BridgeStats {
        let metrics = self.shared.metrics.snapshot();
        BridgeStats {
            subscribers: self.subscriber_count(),
            forwarded: self.shared.forwarded.load(Ordering::Relaxed),
            duplicates_dropped: metrics.duplicates_dropped,
            late_events: metrics.late_events,
            subscriber_drops: metrics.subscriber_drops,
        }
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Bridge shutdown channel closed".into()))
    }
}

// =============================================================================
// Delivery Bridge
// =============================================================================

/// The bridge task: dedup, reorder and fan-out.
pub struct DeliveryBridge {
    inbound: mpsc::Receiver<InboundMessage>,
    dedup: DedupWindow,
    reorder: ReorderBuffer,
    shared: Arc<BridgeShared>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl DeliveryBridge {
    /// Creates a bridge over a link's inbound stream and returns a handle.
    pub fn new(
        inbound: mpsc::Receiver<InboundMessage>,
        settings: &BridgeSettings,
        metrics: Arc<SyncMetrics>,
    ) -> (Self, BridgeHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let shared = Arc::new(BridgeShared {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            forwarded: AtomicU64::new(0),
            queue_capacity: settings.subscriber_queue,
            metrics,
        });

        let bridge = DeliveryBridge {
            inbound,
            dedup: DedupWindow::new(settings.dedup_window),
            reorder: ReorderBuffer::new(settings.reorder_hold()),
            shared: shared.clone(),
            shutdown_rx,
        };

        (bridge, BridgeHandle { shared, shutdown_tx })
    }

    /// Runs the fan-out loop.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!("Delivery bridge starting");

        loop {
            let deadline = self.reorder.next_deadline();

            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => {
                        info!("Inbound stream closed");
                        break;
                    }
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let released = self.reorder.expire(Instant::now());
                    self.release(released);
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Delivery bridge received shutdown");
                    break;
                }
            }
        }

        let held = self.reorder.flush();
        self.release(held);
        self.shared.close_all();

        info!("Delivery bridge stopped");
    }

    fn handle(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::Telemetry(event) => self.accept(event),
            InboundMessage::Status(status) => {
                debug!(source_id = %status.source_id, state = ?status.state, "Presence change");
                self.shared.fan_out(BridgeEvent::Presence(status));
            }
            InboundMessage::Credential(record) => {
                debug!(user_id = record.user_id, "Ignoring credential message on bridge");
            }
        }
    }

    fn accept(&mut self, event: TelemetryEvent) {
        if !self.dedup.insert(event.event_id) {
            self.shared.metrics.add_duplicates_dropped(1);
            debug!(event_id = %event.event_id, device_id = %event.device_id, "Dropped duplicate event");
            return;
        }

        let released = self.reorder.push(event, Instant::now());
        self.release(released);
    }

    fn release(&self, released: Vec<Released>) {
        for Released { event, late } in released {
            if late {
                self.shared.metrics.add_late_events(1);
                debug!(
                    event_id = %event.event_id,
                    device_id = %event.device_id,
                    sequence = event.sequence,
                    "Forwarding late event"
                );
            }
            self.shared.forwarded.fetch_add(1, Ordering::Relaxed);
            self.shared.fan_out(BridgeEvent::Telemetry(event));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

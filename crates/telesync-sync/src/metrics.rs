//! # Sync Metrics
//!
//! Process-wide counters shared by the link, pipeline, bridge and
//! credential engine. Every data-loss or data-discard boundary has one.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters. Share behind an `Arc`.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    evictions: AtomicU64,
    duplicates_dropped: AtomicU64,
    late_events: AtomicU64,
    subscriber_drops: AtomicU64,
    malformed_messages: AtomicU64,
    stale_credentials: AtomicU64,
    publish_timeouts: AtomicU64,
    published: AtomicU64,
    acked: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub evictions: u64,
    pub duplicates_dropped: u64,
    pub late_events: u64,
    pub subscriber_drops: u64,
    pub malformed_messages: u64,
    pub stale_credentials: u64,
    pub publish_timeouts: u64,
    pub published: u64,
    pub acked: u64,
    pub reconnects: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_evictions, evictions);
    counter!(add_duplicates_dropped, duplicates_dropped);
    counter!(add_late_events, late_events);
    counter!(add_subscriber_drops, subscriber_drops);
    counter!(add_malformed_messages, malformed_messages);
    counter!(add_stale_credentials, stale_credentials);
    counter!(add_publish_timeouts, publish_timeouts);
    counter!(add_published, published);
    counter!(add_acked, acked);
    counter!(add_reconnects, reconnects);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            evictions: self.evictions.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            subscriber_drops: self.subscriber_drops.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            stale_credentials: self.stale_credentials.load(Ordering::Relaxed),
            publish_timeouts: self.publish_timeouts.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

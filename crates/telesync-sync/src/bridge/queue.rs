//! Per-subscriber outbound queue.
//!
//! Bounded and drop-oldest: a slow subscriber loses its stalest events
//! and is told how many with a [`BridgeEvent::Lagged`] frame, while the
//! bridge never waits on it.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::protocol::BridgeEvent;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<BridgeEvent>,
    /// Dropped since the last `Lagged` was handed out.
    unreported: u64,
    dropped_total: u64,
    closed: bool,
}

/// Bounded single-consumer queue with drop-oldest overflow.
#[derive(Debug)]
pub struct SubscriberQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        SubscriberQueue {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Every critical section leaves the state valid, so poisoning is ignored
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues without waiting. Returns the number of events dropped to
    /// make room (0 or 1). Pushing to a closed queue is a no-op.
    pub fn push(&self, event: BridgeEvent) -> u64 {
        let dropped = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            let mut dropped = 0;
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.unreported += 1;
                state.dropped_total += 1;
                dropped = 1;
            }
            state.items.push_back(event);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Next event, or `None` once the queue is closed and drained.
    ///
    /// After an overflow the next call yields `Lagged` first.
    pub async fn recv(&self) -> Option<BridgeEvent> {
        loop {
            {
                let mut state = self.lock();
                if state.unreported > 0 {
                    let dropped = std::mem::take(&mut state.unreported);
                    return Some(BridgeEvent::Lagged { dropped });
                }
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting events; queued events can still be received.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.lock().dropped_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesync_core::{SourceState, SystemStatus};

    fn presence(source: &str) -> BridgeEvent {
        BridgeEvent::Presence(SystemStatus::now(source, SourceState::Online))
    }

    fn source_of(event: &BridgeEvent) -> &str {
        event.device_id().unwrap()
    }

    #[tokio::test]
    async fn test_drop_oldest_reports_lag() {
        let queue = SubscriberQueue::new(2);
        assert_eq!(queue.push(presence("a")), 0);
        assert_eq!(queue.push(presence("b")), 0);
        assert_eq!(queue.push(presence("c")), 1);
        assert_eq!(queue.push(presence("d")), 1);

        assert_eq!(queue.recv().await, Some(BridgeEvent::Lagged { dropped: 2 }));
        assert_eq!(source_of(&queue.recv().await.unwrap()), "c");
        assert_eq!(source_of(&queue.recv().await.unwrap()), "d");
        assert!(queue.is_empty());
        assert_eq!(queue.dropped_total(), 2);
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let queue = std::sync::Arc::new(SubscriberQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::task::yield_now().await;
        queue.push(presence("a"));
        let received = consumer.await.unwrap().unwrap();
        assert_eq!(source_of(&received), "a");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = SubscriberQueue::new(4);
        queue.push(presence("a"));
        queue.close();
        assert_eq!(queue.push(presence("b")), 0);

        assert!(queue.recv().await.is_some());
        assert_eq!(queue.recv().await, None);
    }
}

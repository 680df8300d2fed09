//! Duplicate suppression and per-device reordering for the bridge.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use telesync_core::TelemetryEvent;

// =============================================================================
// Dedup Window
// =============================================================================

/// Bounded set of recently seen event ids. The oldest id is forgotten first.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DedupWindow {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records `id`. Returns false if it is already in the window.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// =============================================================================
// Reorder Buffer
// =============================================================================

/// An event released by the [`ReorderBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Released {
    pub event: TelemetryEvent,

    /// Arrived after a later sequence of the same device was released.
    pub late: bool,
}

#[derive(Debug, Default)]
struct DeviceLane {
    next: Option<u64>,
    held: BTreeMap<u64, (TelemetryEvent, Instant)>,
}

impl DeviceLane {
    /// Releases the contiguous run starting at `next`.
    fn drain_ready(&mut self, out: &mut Vec<Released>) {
        while let Some(next) = self.next {
            match self.held.remove(&next) {
                Some((event, _)) => {
                    out.push(Released { event, late: false });
                    self.next = Some(next.saturating_add(1));
                }
                None => break,
            }
        }
    }
}

/// Holds events that arrive ahead of their device's next expected
/// sequence for up to `hold`.
///
/// ```text
///   next = 3     push(5) ─► held {5}
///                push(3) ─► release 3, next = 4
///                push(4) ─► release 4, 5, next = 6
///                push(2) ─► release 2 (late)
///   hold expires with {8} held and next = 6 ─► release 8, next = 9
/// ```
///
/// The first event seen for a device sets its baseline. A zero hold
/// releases everything immediately.
#[derive(Debug)]
pub struct ReorderBuffer {
    hold: Duration,
    lanes: HashMap<String, DeviceLane>,
}

impl ReorderBuffer {
    pub fn new(hold: Duration) -> Self {
        ReorderBuffer {
            hold,
            lanes: HashMap::new(),
        }
    }

    /// Accepts one event and returns whatever is now releasable, in order.
    pub fn push(&mut self, event: TelemetryEvent, now: Instant) -> Vec<Released> {
        let mut out = Vec::new();
        let hold = self.hold;
        let lane = self.lanes.entry(event.device_id.clone()).or_default();
        let seq = event.sequence;

        match lane.next {
            _ if hold.is_zero() => {
                let late = lane.next.is_some_and(|next| seq < next);
                if !late {
                    lane.next = Some(seq.saturating_add(1));
                }
                out.push(Released { event, late });
            }
            None => {
                lane.next = Some(seq.saturating_add(1));
                out.push(Released { event, late: false });
                lane.drain_ready(&mut out);
            }
            Some(next) if seq == next => {
                lane.next = Some(next.saturating_add(1));
                out.push(Released { event, late: false });
                lane.drain_ready(&mut out);
            }
            Some(next) if seq < next => {
                out.push(Released { event, late: true });
            }
            Some(_) => {
                if lane.held.contains_key(&seq) {
                    // Same sequence under a different event id
                    out.push(Released { event, late: true });
                } else {
                    lane.held.insert(seq, (event, now + hold));
                }
            }
        }

        out
    }

    /// Releases held events whose hold has expired, skipping the gaps
    /// in front of them.
    pub fn expire(&mut self, now: Instant) -> Vec<Released> {
        let mut out = Vec::new();
        for lane in self.lanes.values_mut() {
            let expired_upto = lane
                .held
                .iter()
                .filter(|(_, (_, deadline))| *deadline <= now)
                .map(|(seq, _)| *seq)
                .max();

            if let Some(upto) = expired_upto {
                let rest = match upto.checked_add(1) {
                    Some(bound) => lane.held.split_off(&bound),
                    None => BTreeMap::new(),
                };
                let ready = std::mem::replace(&mut lane.held, rest);
                for (seq, (event, _)) in ready {
                    out.push(Released { event, late: false });
                    lane.next = Some(seq.saturating_add(1));
                }
                lane.drain_ready(&mut out);
            }
        }
        out
    }

    /// Releases everything still held, in per-device order.
    pub fn flush(&mut self) -> Vec<Released> {
        let mut out = Vec::new();
        for lane in self.lanes.values_mut() {
            let held = std::mem::take(&mut lane.held);
            for (seq, (event, _)) in held {
                lane.next = Some(seq.saturating_add(1));
                out.push(Released { event, late: false });
            }
        }
        out
    }

    /// Earliest hold expiry, if anything is held.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lanes
            .values()
            .flat_map(|lane| lane.held.values().map(|(_, deadline)| *deadline))
            .min()
    }

    pub fn held_count(&self) -> usize {
        self.lanes.values().map(|lane| lane.held.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesync_core::TelemetryValue;

    fn ev(device: &str, seq: u64) -> TelemetryEvent {
        TelemetryEvent::new(device, seq, TelemetryValue::Int(seq as i64))
    }

    fn seqs(released: &[Released]) -> Vec<u64> {
        released.iter().map(|r| r.event.sequence).collect()
    }

    #[test]
    fn test_dedup_window_forgets_oldest() {
        let mut window = DedupWindow::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(window.insert(a));
        assert!(!window.insert(a));
        assert!(window.insert(b));
        assert!(window.insert(c));

        assert_eq!(window.len(), 2);
        assert!(!window.contains(&a));
        assert!(window.insert(a));
        assert!(!window.insert(c));
    }

    #[test]
    fn test_reorder_fills_gap() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_millis(200));

        assert_eq!(seqs(&buffer.push(ev("D1", 1), now)), vec![1]);
        assert!(buffer.push(ev("D1", 3), now).is_empty());
        assert!(buffer.push(ev("D1", 4), now).is_empty());
        assert_eq!(buffer.held_count(), 2);

        assert_eq!(seqs(&buffer.push(ev("D1", 2), now)), vec![2, 3, 4]);
        assert_eq!(buffer.held_count(), 0);
        assert_eq!(buffer.next_deadline(), None);
    }

    #[test]
    fn test_reorder_survives_sequence_ceiling() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_millis(200));

        assert_eq!(seqs(&buffer.push(ev("D1", u64::MAX - 2), now)), vec![u64::MAX - 2]);
        assert!(buffer.push(ev("D1", u64::MAX), now).is_empty());
        assert_eq!(
            seqs(&buffer.push(ev("D1", u64::MAX - 1), now)),
            vec![u64::MAX - 1, u64::MAX]
        );

        assert_eq!(seqs(&buffer.push(ev("D2", u64::MAX), now)), vec![u64::MAX]);

        assert!(buffer.push(ev("D3", 1), now).len() == 1);
        assert!(buffer.push(ev("D3", u64::MAX), now).is_empty());
        let expired = buffer.expire(now + Duration::from_millis(200));
        assert_eq!(seqs(&expired), vec![u64::MAX]);
        assert_eq!(buffer.held_count(), 0);

        let mut passthrough = ReorderBuffer::new(Duration::ZERO);
        assert_eq!(seqs(&passthrough.push(ev("D1", u64::MAX), now)), vec![u64::MAX]);
    }

    #[test]
    fn test_reorder_late_event_passes_through() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_millis(200));

        buffer.push(ev("D1", 5), now);
        let released = buffer.push(ev("D1", 2), now);
        assert_eq!(seqs(&released), vec![2]);
        assert!(released[0].late);
    }

    #[test]
    fn test_reorder_expiry_skips_gap() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_millis(200));

        buffer.push(ev("D1", 1), start);
        buffer.push(ev("D1", 4), start);
        buffer.push(ev("D1", 3), start + Duration::from_millis(100));
        assert_eq!(buffer.next_deadline(), Some(start + Duration::from_millis(200)));

        assert!(buffer.expire(start + Duration::from_millis(199)).is_empty());
        assert_eq!(
            seqs(&buffer.expire(start + Duration::from_millis(200))),
            vec![3, 4]
        );

        // 2 shows up after the gap was skipped
        let released = buffer.push(ev("D1", 2), start + Duration::from_millis(300));
        assert!(released[0].late);
    }

    #[test]
    fn test_reorder_devices_independent() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_millis(200));

        buffer.push(ev("D1", 1), now);
        assert!(buffer.push(ev("D1", 3), now).is_empty());
        assert_eq!(seqs(&buffer.push(ev("D2", 7), now)), vec![7]);
        assert_eq!(seqs(&buffer.flush()), vec![3]);
    }

    #[test]
    fn test_zero_hold_disables_reordering() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::ZERO);

        assert_eq!(seqs(&buffer.push(ev("D1", 1), now)), vec![1]);
        assert_eq!(seqs(&buffer.push(ev("D1", 3), now)), vec![3]);
        let released = buffer.push(ev("D1", 2), now);
        assert!(released[0].late);
        assert_eq!(buffer.held_count(), 0);
    }
}

//! # Transmission Ordering
//!
//! Batches leave the buffer in enqueue order (the global approximation of
//! capture order), but within one device the order must follow `sequence`
//! even if records were enqueued out of order.
//!
//! ```text
//!   enqueue order:  D1#2  D2#7  D1#1  D2#8
//!   slots per dev:  D1 ─ [0, 2]   D2 ─ [1, 3]
//!   result:         D1#1  D2#7  D1#2  D2#8
//! ```
//!
//! Each device keeps the positions its records already occupy; only the
//! assignment of records to those positions is sorted by sequence.

use std::collections::HashMap;

use crate::types::BufferedRecord;

/// Orders a batch for publishing.
///
/// Global order is `(enqueued_at, record_id)`. Per device, `sequence` is
/// non-decreasing.
pub fn order_for_transmission(mut records: Vec<BufferedRecord>) -> Vec<BufferedRecord> {
    records.sort_by(|a, b| {
        a.enqueued_at
            .cmp(&b.enqueued_at)
            .then(a.record_id.cmp(&b.record_id))
    });

    let mut slots: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        slots
            .entry(record.event.device_id.clone())
            .or_default()
            .push(idx);
    }

    let mut placed: Vec<Option<BufferedRecord>> = Vec::with_capacity(records.len());
    placed.resize_with(records.len(), || None);

    let mut by_device: HashMap<String, Vec<BufferedRecord>> = HashMap::new();
    for record in records {
        by_device
            .entry(record.event.device_id.clone())
            .or_default()
            .push(record);
    }

    for (device, mut device_records) in by_device {
        device_records.sort_by_key(|r| r.event.sequence);
        let positions = slots.remove(&device).unwrap_or_default();
        for (pos, record) in positions.into_iter().zip(device_records) {
            placed[pos] = Some(record);
        }
    }

    placed.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordState, TelemetryEvent, TelemetryValue};
    use chrono::{Duration, Utc};

    fn rec(record_id: i64, device: &str, sequence: u64, offset_ms: i64) -> BufferedRecord {
        let base = Utc::now();
        BufferedRecord {
            record_id,
            event: TelemetryEvent::new(device, sequence, TelemetryValue::Int(0)),
            state: RecordState::InFlight,
            enqueued_at: base + Duration::milliseconds(offset_ms),
            attempts: 0,
        }
    }

    fn summary(records: &[BufferedRecord]) -> Vec<(String, u64)> {
        records
            .iter()
            .map(|r| (r.event.device_id.clone(), r.event.sequence))
            .collect()
    }

    #[test]
    fn test_in_order_batch_is_unchanged() {
        let batch = vec![rec(1, "D1", 1, 0), rec(2, "D1", 2, 1), rec(3, "D2", 1, 2)];
        let ordered = order_for_transmission(batch);
        assert_eq!(
            summary(&ordered),
            vec![("D1".into(), 1), ("D1".into(), 2), ("D2".into(), 1)]
        );
    }

    #[test]
    fn test_per_device_sequence_is_restored() {
        let batch = vec![
            rec(1, "D1", 2, 0),
            rec(2, "D2", 7, 1),
            rec(3, "D1", 1, 2),
            rec(4, "D2", 8, 3),
        ];
        let ordered = order_for_transmission(batch);
        assert_eq!(
            summary(&ordered),
            vec![
                ("D1".into(), 1),
                ("D2".into(), 7),
                ("D1".into(), 2),
                ("D2".into(), 8)
            ]
        );
    }

    #[test]
    fn test_record_id_breaks_enqueue_ties() {
        let mut a = rec(5, "D1", 1, 0);
        let mut b = rec(4, "D2", 1, 0);
        b.enqueued_at = a.enqueued_at;
        a.enqueued_at = b.enqueued_at;
        let ordered = order_for_transmission(vec![a, b]);
        assert_eq!(ordered[0].record_id, 4);
    }
}

//! # Buffer Repository
//!
//! The durable buffer for captured telemetry awaiting broker acknowledgment.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Buffered Record Lifecycle                            │
//! │                                                                         │
//! │  capture / append                                                       │
//! │       │   (one transaction: sequence bump, eviction, insert)            │
//! │       ▼                                                                 │
//! │  ┌─────────┐  mark_in_flight(n)   ┌───────────┐   ack(ids)              │
//! │  │ PENDING │ ───────────────────► │ IN_FLIGHT │ ─────────► purged       │
//! │  └─────────┘                      └───────────┘                         │
//! │       ▲        requeue(ids)             │                               │
//! │       └──────── recover_in_flight() ────┘  attempts += 1                │
//! │                                                                         │
//! │  AT CAPACITY:                                                           │
//! │  • oldest PENDING rows are deleted to make room (evicted, counted)      │
//! │  • no PENDING row? the incoming event is refused (BufferFull, counted)  │
//! │  • IN_FLIGHT rows are never evicted                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! Every state-changing operation holds the shared write lock for the whole
//! transaction, so two callers of `mark_in_flight` can never claim the same
//! row, and eviction decisions see a consistent count.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use telesync_core::ordering::order_for_transmission;
use telesync_core::validation::normalize_event;
use telesync_core::{BufferedRecord, DataType, RecordState, TelemetryEvent, TelemetryValue};

const TABLE: &str = "buffered_records";

// =============================================================================
// Supporting Types
// =============================================================================

/// Process-wide counters shared by every repository handle of one database.
#[derive(Debug, Default)]
pub struct BufferStats {
    evicted: AtomicU64,
    /// Rows dropped because they could not be decoded.
    discarded: AtomicU64,
    /// Last `enqueued_at` handed out, in microseconds. Keeps enqueue order
    /// non-decreasing even if the wall clock steps backwards.
    last_enqueued_us: AtomicI64,
}

/// Result of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    /// Row id of the (new or existing) record.
    pub record_id: i64,

    /// The event id was already buffered; nothing changed.
    pub duplicate: bool,

    /// Events deleted to make room for this one.
    pub evicted: Vec<Uuid>,
}

/// Current buffer depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDepth {
    pub pending: u64,
    pub in_flight: u64,
}

impl BufferDepth {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BufferRow {
    record_id: i64,
    event_id: String,
    device_id: String,
    data_type: DataType,
    value: String,
    captured_at: String,
    sequence: i64,
    state: RecordState,
    enqueued_at: i64,
    attempts: i64,
}

impl TryFrom<BufferRow> for BufferedRecord {
    type Error = DbError;

    fn try_from(row: BufferRow) -> Result<Self, Self::Error> {
        let event_id = Uuid::parse_str(&row.event_id).map_err(|e| DbError::corrupt(TABLE, e))?;
        let value: TelemetryValue =
            serde_json::from_str(&row.value).map_err(|e| DbError::corrupt(TABLE, e))?;
        let value = value.conform(row.data_type).ok_or_else(|| {
            DbError::corrupt(TABLE, format!("value {} is not {}", row.value, row.data_type))
        })?;
        let captured_at = DateTime::parse_from_rfc3339(&row.captured_at)
            .map_err(|e| DbError::corrupt(TABLE, e))?
            .with_timezone(&Utc);
        let enqueued_at = Utc
            .timestamp_micros(row.enqueued_at)
            .single()
            .ok_or_else(|| DbError::corrupt(TABLE, "enqueued_at out of range"))?;

        Ok(BufferedRecord {
            record_id: row.record_id,
            event: TelemetryEvent {
                event_id,
                device_id: row.device_id,
                data_type: row.data_type,
                value,
                captured_at,
                sequence: u64::try_from(row.sequence).map_err(|e| DbError::corrupt(TABLE, e))?,
            },
            state: row.state,
            enqueued_at,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
        })
    }
}

enum Insertion {
    Inserted { record_id: i64, evicted: Vec<Uuid> },
    Duplicate { record_id: i64 },
    Refused,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the durable telemetry buffer.
#[derive(Debug, Clone)]
pub struct BufferRepository {
    pool: SqlitePool,
    capacity: u64,
    lock: Arc<Mutex<()>>,
    stats: Arc<BufferStats>,
}

impl BufferRepository {
    /// Creates a new BufferRepository. Use [`crate::Database::buffer`].
    pub(crate) fn new(
        pool: SqlitePool,
        capacity: u64,
        lock: Arc<Mutex<()>>,
        stats: Arc<BufferStats>,
    ) -> Self {
        BufferRepository {
            pool,
            capacity,
            lock,
            stats,
        }
    }

    /// Maximum retained records.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total events lost to capacity since this process opened the store.
    pub fn evicted_total(&self) -> u64 {
        self.stats.evicted.load(Ordering::Relaxed)
    }

    /// Undecodable records dropped by [`mark_in_flight`](Self::mark_in_flight).
    pub fn discarded_total(&self) -> u64 {
        self.stats.discarded.load(Ordering::Relaxed)
    }

    /// Captures a new reading for `device_id`.
    ///
    /// Assigns a fresh `event_id` and the device's next `sequence`, and
    /// buffers the event, all in one transaction.
    pub async fn capture(
        &self,
        device_id: &str,
        value: TelemetryValue,
    ) -> DbResult<(TelemetryEvent, AppendReceipt)> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO device_sequences (device_id, last_sequence) VALUES (?1, 1)
            ON CONFLICT (device_id) DO UPDATE SET last_sequence = last_sequence + 1
            RETURNING last_sequence
            "#,
        )
        .bind(device_id)
        .fetch_one(&mut *tx)
        .await?;

        // Dropping `tx` on a rejected event rolls the sequence bump back
        let event = normalize_event(TelemetryEvent::new(device_id, sequence as u64, value))?;

        match self.insert_in_tx(&mut tx, &event).await? {
            Insertion::Inserted { record_id, evicted } => {
                tx.commit().await?;
                self.count_evictions(evicted.len() as u64);
                debug!(
                    event_id = %event.event_id,
                    device_id = %device_id,
                    sequence = sequence,
                    "Captured telemetry event"
                );
                Ok((
                    event,
                    AppendReceipt {
                        record_id,
                        duplicate: false,
                        evicted,
                    },
                ))
            }
            Insertion::Duplicate { .. } => {
                Err(DbError::Internal(format!(
                    "generated event id {} already buffered",
                    event.event_id
                )))
            }
            Insertion::Refused => {
                tx.rollback().await?;
                self.refuse(&event)
            }
        }
    }

    /// Buffers an already-built event.
    ///
    /// Idempotent per `event_id`: a second append of the same id returns the
    /// existing `record_id` with `duplicate = true`.
    ///
    /// ## Errors
    /// - [`DbError::InvalidRecord`] if the event fails validation; nothing
    ///   is written
    pub async fn append(&self, event: &TelemetryEvent) -> DbResult<AppendReceipt> {
        let event = &normalize_event(event.clone())?;
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // Keep future captures for this device above any appended sequence
        sqlx::query(
            r#"
            INSERT INTO device_sequences (device_id, last_sequence) VALUES (?1, ?2)
            ON CONFLICT (device_id) DO UPDATE
                SET last_sequence = MAX(last_sequence, excluded.last_sequence)
            "#,
        )
        .bind(&event.device_id)
        .bind(stored_sequence(event)?)
        .execute(&mut *tx)
        .await?;

        match self.insert_in_tx(&mut tx, event).await? {
            Insertion::Inserted { record_id, evicted } => {
                tx.commit().await?;
                self.count_evictions(evicted.len() as u64);
                Ok(AppendReceipt {
                    record_id,
                    duplicate: false,
                    evicted,
                })
            }
            Insertion::Duplicate { record_id } => {
                tx.rollback().await?;
                debug!(event_id = %event.event_id, "Event already buffered");
                Ok(AppendReceipt {
                    record_id,
                    duplicate: true,
                    evicted: Vec::new(),
                })
            }
            Insertion::Refused => {
                tx.rollback().await?;
                self.refuse(event)
            }
        }
    }

    /// Claims up to `limit` of the oldest PENDING records.
    ///
    /// The claimed rows move to IN_FLIGHT in a single statement, and are
    /// returned in transmission order (enqueue order, with per-device
    /// `sequence` non-decreasing).
    pub async fn mark_in_flight(&self, limit: u32) -> DbResult<Vec<BufferedRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.lock.lock().await;

        let rows = sqlx::query_as::<_, BufferRow>(
            r#"
            UPDATE buffered_records SET state = 'in_flight'
            WHERE record_id IN (
                SELECT record_id FROM buffered_records
                WHERE state = 'pending'
                ORDER BY enqueued_at ASC, record_id ASC
                LIMIT ?1
            )
            RETURNING record_id, event_id, device_id, data_type, value,
                      captured_at, sequence, state, enqueued_at, attempts
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for row in rows {
            let record_id = row.record_id;
            match BufferedRecord::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(record_id = record_id, error = %e, "Discarding undecodable buffered record");
                    corrupt.push(record_id);
                }
            }
        }

        // An unreadable row can never be sent; leaving it would wedge the queue
        if !corrupt.is_empty() {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM buffered_records WHERE record_id IN (");
            let mut separated = qb.separated(", ");
            for record_id in &corrupt {
                separated.push_bind(*record_id);
            }
            separated.push_unseparated(")");
            qb.build().execute(&self.pool).await?;
            self.stats
                .discarded
                .fetch_add(corrupt.len() as u64, Ordering::Relaxed);
        }

        if !records.is_empty() {
            debug!(count = records.len(), "Marked records in flight");
        }

        Ok(order_for_transmission(records))
    }

    /// Acknowledges delivered records; they are purged immediately.
    ///
    /// Only IN_FLIGHT rows are affected, so acknowledging twice is a no-op.
    /// Returns the number of records acknowledged.
    pub async fn ack(&self, event_ids: &[Uuid]) -> DbResult<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "DELETE FROM buffered_records WHERE state = 'in_flight' AND event_id IN (",
        );
        push_ids(&mut qb, event_ids);

        let acked = qb.build().execute(&self.pool).await?.rows_affected();
        debug!(acked = acked, requested = event_ids.len(), "Acked records");
        Ok(acked)
    }

    /// Returns IN_FLIGHT records to PENDING for another attempt.
    ///
    /// Returns the number of records requeued.
    pub async fn requeue(&self, event_ids: &[Uuid]) -> DbResult<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE buffered_records SET state = 'pending', attempts = attempts + 1 \
             WHERE state = 'in_flight' AND event_id IN (",
        );
        push_ids(&mut qb, event_ids);

        let requeued = qb.build().execute(&self.pool).await?.rows_affected();
        debug!(requeued = requeued, "Requeued records");
        Ok(requeued)
    }

    /// Requeues every IN_FLIGHT record.
    ///
    /// Called on startup (delivery of anything left IN_FLIGHT by a previous
    /// process was never confirmed) and after a shutdown grace period.
    pub async fn recover_in_flight(&self) -> DbResult<u64> {
        let _guard = self.lock.lock().await;

        let recovered = sqlx::query(
            "UPDATE buffered_records SET state = 'pending', attempts = attempts + 1 \
             WHERE state = 'in_flight'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            info!(recovered = recovered, "Requeued in-flight records");
        }
        Ok(recovered)
    }

    /// Counts PENDING and IN_FLIGHT records.
    pub async fn depth(&self) -> DbResult<BufferDepth> {
        let (pending, in_flight): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'in_flight' THEN 1 ELSE 0 END), 0)
            FROM buffered_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BufferDepth {
            pending: pending as u64,
            in_flight: in_flight as u64,
        })
    }

    /// Looks up one buffered record by event id.
    pub async fn get(&self, event_id: Uuid) -> DbResult<Option<BufferedRecord>> {
        sqlx::query_as::<_, BufferRow>(
            r#"
            SELECT record_id, event_id, device_id, data_type, value,
                   captured_at, sequence, state, enqueued_at, attempts
            FROM buffered_records WHERE event_id = ?1
            "#,
        )
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(BufferedRecord::try_from)
        .transpose()
    }

    // =========================================================================
    // Internals (caller holds the write lock)
    // =========================================================================

    async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &TelemetryEvent,
    ) -> DbResult<Insertion> {
        let event_id = event.event_id.to_string();

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT record_id FROM buffered_records WHERE event_id = ?1")
                .bind(&event_id)
                .fetch_optional(&mut **tx)
                .await?;
        if let Some(record_id) = existing {
            return Ok(Insertion::Duplicate { record_id });
        }

        let retained: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffered_records")
            .fetch_one(&mut **tx)
            .await?;
        let overflow = (retained as u64 + 1).saturating_sub(self.capacity);

        let mut evicted = Vec::new();
        if overflow > 0 {
            let victims: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT event_id FROM buffered_records
                WHERE state = 'pending'
                ORDER BY enqueued_at ASC, record_id ASC
                LIMIT ?1
                "#,
            )
            .bind(overflow as i64)
            .fetch_all(&mut **tx)
            .await?;

            if (victims.len() as u64) < overflow {
                return Ok(Insertion::Refused);
            }

            for victim in victims {
                sqlx::query("DELETE FROM buffered_records WHERE event_id = ?1")
                    .bind(&victim)
                    .execute(&mut **tx)
                    .await?;
                evicted.push(Uuid::parse_str(&victim).map_err(|e| DbError::corrupt(TABLE, e))?);
            }
        }

        let value =
            serde_json::to_string(&event.value).map_err(|e| DbError::Internal(e.to_string()))?;

        let record_id = sqlx::query(
            r#"
            INSERT INTO buffered_records (
                event_id, device_id, data_type, value, captured_at,
                sequence, state, enqueued_at, attempts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, 0)
            "#,
        )
        .bind(&event_id)
        .bind(&event.device_id)
        .bind(event.data_type)
        .bind(value)
        .bind(event.captured_at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .bind(stored_sequence(event)?)
        .bind(self.next_enqueued_at())
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();

        if !evicted.is_empty() {
            warn!(
                evicted = evicted.len(),
                capacity = self.capacity,
                "Buffer at capacity, evicted oldest pending events"
            );
        }

        Ok(Insertion::Inserted { record_id, evicted })
    }

    fn next_enqueued_at(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let prev = self.stats.last_enqueued_us.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }

    fn count_evictions(&self, n: u64) {
        if n > 0 {
            self.stats.evicted.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn refuse<T>(&self, event: &TelemetryEvent) -> DbResult<T> {
        self.count_evictions(1);
        warn!(
            event_id = %event.event_id,
            device_id = %event.device_id,
            capacity = self.capacity,
            "Buffer full of in-flight records, dropping incoming event"
        );
        Err(DbError::BufferFull {
            capacity: self.capacity,
        })
    }
}

fn stored_sequence(event: &TelemetryEvent) -> DbResult<i64> {
    i64::try_from(event.sequence)
        .map_err(|_| DbError::Internal(format!("sequence {} out of range", event.sequence)))
}

fn push_ids(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[Uuid]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated(")");
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use std::collections::HashSet;

    async fn db_with_capacity(capacity: u64) -> Database {
        Database::new(DbConfig::in_memory().buffer_capacity(capacity))
            .await
            .unwrap()
    }

    fn ids(records: &[BufferedRecord]) -> Vec<Uuid> {
        records.iter().map(|r| r.event.event_id).collect()
    }

    #[tokio::test]
    async fn test_capture_assigns_increasing_sequence() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();

        let (e1, _) = buffer.capture("D1", TelemetryValue::Int(1)).await.unwrap();
        let (e2, _) = buffer.capture("D1", TelemetryValue::Int(2)).await.unwrap();
        let (other, _) = buffer.capture("D2", TelemetryValue::Bool(true)).await.unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
        assert_eq!(other.sequence, 1);
        assert_eq!(buffer.depth().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_append_is_idempotent_per_event_id() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();
        let event = TelemetryEvent::new("D1", 1, TelemetryValue::Float(1.5));

        let first = buffer.append(&event).await.unwrap();
        let second = buffer.append(&event).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(buffer.depth().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_append_then_capture_keeps_sequence_monotonic() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();

        buffer
            .append(&TelemetryEvent::new("D1", 41, TelemetryValue::Int(0)))
            .await
            .unwrap();
        let (next, _) = buffer.capture("D1", TelemetryValue::Int(0)).await.unwrap();
        assert_eq!(next.sequence, 42);
    }

    #[tokio::test]
    async fn test_capture_rejects_non_finite_float() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();

        let err = buffer.capture("D1", TelemetryValue::Float(f64::NAN)).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidRecord(_)));

        // The rejected reading does not consume a sequence number
        let (event, _) = buffer.capture("D1", TelemetryValue::Int(1)).await.unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(buffer.depth().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_append_rejects_unstorable_sequence() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();

        let event = TelemetryEvent::new("D1", u64::MAX, TelemetryValue::Int(1));
        let err = buffer.append(&event).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidRecord(_)));
        assert_eq!(buffer.depth().await.unwrap().total(), 0);

        let (next, _) = buffer.capture("D1", TelemetryValue::Int(2)).await.unwrap();
        assert_eq!(next.sequence, 1);
    }

    #[tokio::test]
    async fn test_undecodable_row_does_not_block_the_queue() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();
        let (bad, _) = buffer.capture("D1", TelemetryValue::Float(1.0)).await.unwrap();
        let (good, _) = buffer.capture("D1", TelemetryValue::Float(2.0)).await.unwrap();

        sqlx::query("UPDATE buffered_records SET value = 'null' WHERE event_id = ?1")
            .bind(bad.event_id.to_string())
            .execute(&buffer.pool)
            .await
            .unwrap();

        let batch = buffer.mark_in_flight(10).await.unwrap();
        assert_eq!(ids(&batch), vec![good.event_id]);
        assert_eq!(buffer.discarded_total(), 1);
        assert!(buffer.get(bad.event_id).await.unwrap().is_none());

        buffer.recover_in_flight().await.unwrap();
        let batch = buffer.mark_in_flight(10).await.unwrap();
        assert_eq!(ids(&batch), vec![good.event_id]);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_event() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();
        let (event, _) = buffer.capture("D1", TelemetryValue::Float(20.0)).await.unwrap();

        let batch = buffer.mark_in_flight(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event, event);
        assert_eq!(batch[0].state, RecordState::InFlight);
        assert_eq!(batch[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_mark_in_flight_returns_oldest_in_order() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();
        for i in 0..5 {
            buffer.capture("D1", TelemetryValue::Int(i)).await.unwrap();
        }

        let first = buffer.mark_in_flight(3).await.unwrap();
        let sequences: Vec<u64> = first.iter().map(|r| r.event.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        let second = buffer.mark_in_flight(3).await.unwrap();
        let sequences: Vec<u64> = second.iter().map(|r| r.event.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);

        assert!(buffer.mark_in_flight(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_mark_in_flight_never_shares_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("concurrent.db")).max_connections(4))
            .await
            .unwrap();

        for i in 0..200 {
            db.buffer().capture("D1", TelemetryValue::Int(i)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let buffer = db.buffer();
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let batch = buffer.mark_in_flight(7).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|r| r.event.event_id));
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "record {id} claimed twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn test_ack_purges_and_is_not_repeatable() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();
        buffer.capture("D1", TelemetryValue::Int(1)).await.unwrap();
        buffer.capture("D1", TelemetryValue::Int(2)).await.unwrap();

        let batch = buffer.mark_in_flight(10).await.unwrap();
        assert_eq!(buffer.ack(&ids(&batch)).await.unwrap(), 2);
        assert_eq!(buffer.ack(&ids(&batch)).await.unwrap(), 0);
        assert_eq!(buffer.depth().await.unwrap().total(), 0);
        assert!(buffer.get(batch[0].event.event_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ack_ignores_pending_records() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();
        let (event, _) = buffer.capture("D1", TelemetryValue::Int(1)).await.unwrap();

        assert_eq!(buffer.ack(&[event.event_id]).await.unwrap(), 0);
        assert_eq!(buffer.depth().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_requeue_increments_attempts_and_preserves_order() {
        let db = db_with_capacity(100).await;
        let buffer = db.buffer();
        for i in 0..3 {
            buffer.capture("D1", TelemetryValue::Int(i)).await.unwrap();
        }

        let batch = buffer.mark_in_flight(2).await.unwrap();
        assert_eq!(buffer.requeue(&ids(&batch)).await.unwrap(), 2);

        let retry = buffer.mark_in_flight(3).await.unwrap();
        let sequences: Vec<u64> = retry.iter().map(|r| r.event.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(retry[0].attempts, 1);
        assert_eq!(retry[2].attempts, 0);
    }

    #[tokio::test]
    async fn test_eviction_counts_exact_overflow_oldest_first() {
        let db = db_with_capacity(3).await;
        let buffer = db.buffer();

        let mut events = Vec::new();
        for i in 0..5 {
            let (event, _) = buffer.capture("D1", TelemetryValue::Int(i)).await.unwrap();
            events.push(event);
        }

        assert_eq!(buffer.evicted_total(), 2);
        assert!(buffer.get(events[0].event_id).await.unwrap().is_none());
        assert!(buffer.get(events[1].event_id).await.unwrap().is_none());

        let remaining = buffer.mark_in_flight(10).await.unwrap();
        let sequences: Vec<u64> = remaining.iter().map(|r| r.event.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_eviction_skips_in_flight_records() {
        let db = db_with_capacity(3).await;
        let buffer = db.buffer();

        let (oldest, _) = buffer.capture("D1", TelemetryValue::Int(0)).await.unwrap();
        buffer.mark_in_flight(1).await.unwrap();
        let (pending, _) = buffer.capture("D1", TelemetryValue::Int(1)).await.unwrap();
        buffer.capture("D1", TelemetryValue::Int(2)).await.unwrap();

        let (_, receipt) = buffer.capture("D1", TelemetryValue::Int(3)).await.unwrap();
        assert_eq!(receipt.evicted, vec![pending.event_id]);
        assert!(buffer.get(oldest.event_id).await.unwrap().is_some());
        assert_eq!(buffer.evicted_total(), 1);
    }

    #[tokio::test]
    async fn test_full_of_in_flight_refuses_incoming() {
        let db = db_with_capacity(2).await;
        let buffer = db.buffer();
        buffer.capture("D1", TelemetryValue::Int(0)).await.unwrap();
        buffer.capture("D1", TelemetryValue::Int(1)).await.unwrap();
        buffer.mark_in_flight(2).await.unwrap();

        let err = buffer.capture("D1", TelemetryValue::Int(2)).await.unwrap_err();
        assert!(matches!(err, DbError::BufferFull { capacity: 2 }));
        assert_eq!(buffer.evicted_total(), 1);
        assert_eq!(buffer.depth().await.unwrap().in_flight, 2);

        // The refused capture did not consume a sequence number
        buffer.recover_in_flight().await.unwrap();
        let batch = buffer.mark_in_flight(2).await.unwrap();
        buffer.ack(&ids(&batch)).await.unwrap();
        let (next, _) = buffer.capture("D1", TelemetryValue::Int(3)).await.unwrap();
        assert_eq!(next.sequence, 3);
    }

    #[tokio::test]
    async fn test_crash_recovery_requeues_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        let claimed = {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            db.buffer().capture("D1", TelemetryValue::Int(1)).await.unwrap();
            db.buffer().capture("D1", TelemetryValue::Int(2)).await.unwrap();
            let batch = db.buffer().mark_in_flight(10).await.unwrap();
            // Process dies here: no ack, no requeue
            db.close().await;
            ids(&batch)
        };

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let buffer = db.buffer();
        assert_eq!(buffer.depth().await.unwrap().in_flight, 2);

        assert_eq!(buffer.recover_in_flight().await.unwrap(), 2);
        let retry = buffer.mark_in_flight(10).await.unwrap();
        assert_eq!(ids(&retry), claimed);
        assert!(retry.iter().all(|r| r.attempts == 1));

        assert_eq!(buffer.ack(&ids(&retry)).await.unwrap(), 2);
        assert_eq!(buffer.depth().await.unwrap().total(), 0);
    }
}

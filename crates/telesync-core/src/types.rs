//! # Domain Types
//!
//! Core domain types shared by the edge client and the central service.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐        │
//! │  │ TelemetryEvent  │   │ BufferedRecord  │   │CredentialRecord │        │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │        │
//! │  │  event_id       │◄──│  event          │   │  user_id        │        │
//! │  │  device_id      │   │  state          │   │  version        │        │
//! │  │  data_type      │   │  enqueued_at    │   │  fields         │        │
//! │  │  value          │   │  attempts       │   │  tombstone      │        │
//! │  │  captured_at    │   └─────────────────┘   └─────────────────┘        │
//! │  │  sequence       │                                                    │
//! │  └─────────────────┘   ┌─────────────────┐   ┌─────────────────┐        │
//! │                        │  RecordState    │   │  SystemStatus   │        │
//! │                        │  Pending        │   │  source_id      │        │
//! │                        │  InFlight       │   │  state          │        │
//! │                        │  Acked          │   │  timestamp      │        │
//! │                        └─────────────────┘   └─────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! - `event_id` is generated at capture time and is the deduplication key
//!   end-to-end (buffer, broker, bridge).
//! - `sequence` is a per-device counter; it orders one device's events but
//!   says nothing about other devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

// =============================================================================
// Telemetry Values
// =============================================================================

/// Kind of a telemetry reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Float,
    Bool,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reading. Serialized as a bare JSON scalar.
///
/// Variant order matters for untagged deserialization: `true` must not
/// become a number, and `3` must stay an integer until a declared
/// `data_type` says otherwise (see [`TelemetryValue::conform`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(untagged)]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl TelemetryValue {
    /// The data type this value naturally carries.
    pub fn data_type(&self) -> DataType {
        match self {
            TelemetryValue::Bool(_) => DataType::Bool,
            TelemetryValue::Int(_) => DataType::Int,
            TelemetryValue::Float(_) => DataType::Float,
        }
    }

    /// Coerces this value into the declared type.
    ///
    /// Only one widening is allowed: an integral value declared `float`.
    /// Everything else must match exactly.
    pub fn conform(self, declared: DataType) -> Option<TelemetryValue> {
        match (self, declared) {
            (TelemetryValue::Int(v), DataType::Float) => Some(TelemetryValue::Float(v as f64)),
            (value, declared) if value.data_type() == declared => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for TelemetryValue {
    fn from(v: i64) -> Self {
        TelemetryValue::Int(v)
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        TelemetryValue::Float(v)
    }
}

impl From<bool> for TelemetryValue {
    fn from(v: bool) -> Self {
        TelemetryValue::Bool(v)
    }
}

// =============================================================================
// Telemetry Event
// =============================================================================

/// One captured reading. Immutable once created.
///
/// This is also the wire payload of the `telemetry/data` topic and the
/// shape real-time subscribers receive from the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TelemetryEvent {
    /// Deduplication key, generated at capture time.
    #[ts(as = "String")]
    pub event_id: Uuid,

    /// Capturing device.
    pub device_id: String,

    /// Declared kind of `value`.
    pub data_type: DataType,

    /// The reading itself.
    pub value: TelemetryValue,

    /// When the reading was taken on the device.
    #[ts(as = "String")]
    pub captured_at: DateTime<Utc>,

    /// Monotonic per-device counter.
    pub sequence: u64,
}

impl TelemetryEvent {
    /// Creates a new event with a fresh `event_id`, captured now.
    pub fn new(device_id: impl Into<String>, sequence: u64, value: TelemetryValue) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            device_id: device_id.into(),
            data_type: value.data_type(),
            value,
            captured_at: Utc::now(),
            sequence,
        }
    }

    /// Overrides the capture timestamp.
    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = at;
        self
    }
}

// =============================================================================
// Buffered Record
// =============================================================================

/// Lifecycle of a buffered event.
///
/// ```text
///   append          mark_in_flight          ack
///  ───────► PENDING ──────────────► IN_FLIGHT ────► ACKED (purged)
///              ▲                       │
///              └────── requeue ────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    InFlight,
    Acked,
}

impl RecordState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: RecordState) -> bool {
        matches!(
            (self, next),
            (RecordState::Pending, RecordState::InFlight)
                | (RecordState::InFlight, RecordState::Acked)
                | (RecordState::InFlight, RecordState::Pending)
        )
    }
}

/// A telemetry event owned by the buffer store until acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    /// Store-assigned id; increases with every append.
    pub record_id: i64,

    pub event: TelemetryEvent,

    pub state: RecordState,

    /// When the store accepted the event.
    pub enqueued_at: DateTime<Utc>,

    /// Number of times this record has been requeued for retry.
    pub attempts: u32,
}

// =============================================================================
// Credentials
// =============================================================================

/// User role as known by the system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

/// Credential payload of a live (non-deleted) user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CredentialFields {
    pub username: String,

    #[serde(default)]
    pub role: Role,

    pub active: bool,

    /// Opaque hash produced by the system of record. Never a plaintext password.
    pub password_hash: String,
}

/// A version-stamped credential state, also the `users/sync` payload.
///
/// Deletion is a record with `tombstone = true` and no fields; it merges
/// like any other update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CredentialRecord {
    pub user_id: i64,

    /// Sole conflict-resolution authority.
    pub version: u64,

    #[serde(default)]
    pub fields: Option<CredentialFields>,

    #[serde(default)]
    pub tombstone: bool,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// A live credential at `version`.
    pub fn live(user_id: i64, version: u64, fields: CredentialFields) -> Self {
        Self {
            user_id,
            version,
            fields: Some(fields),
            tombstone: false,
            updated_at: Utc::now(),
        }
    }

    /// A deletion marker at `version`.
    pub fn tombstone(user_id: i64, version: u64) -> Self {
        Self {
            user_id,
            version,
            fields: None,
            tombstone: true,
            updated_at: Utc::now(),
        }
    }

    /// Whether this user may authenticate.
    pub fn is_active(&self) -> bool {
        !self.tombstone && self.fields.as_ref().is_some_and(|f| f.active)
    }
}

// =============================================================================
// System Status
// =============================================================================

/// Connection state a source announces on `system/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Online,
    Offline,
    Reconnecting,
}

/// Payload of the `system/status` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SystemStatus {
    pub source_id: String,
    pub state: SourceState,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl SystemStatus {
    pub fn now(source_id: impl Into<String>, state: SourceState) -> Self {
        Self {
            source_id: source_id.into(),
            state,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

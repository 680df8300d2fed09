//! # Status and Health
//!
//! What the edge client shows as its connectivity indicator, and the
//! degraded-health signals handed to an external monitoring collaborator.
//!
//! ## Signals
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Source                  Signal                                         │
//! │  ──────                  ──────                                         │
//! │  BrokerLink              Degraded(ReconnectCeiling) after N failed      │
//! │                          reconnects in a row; Healthy on connect        │
//! │                                                                         │
//! │  SyncAgent status tick   Degraded(BufferOverflow) when evictions grew   │
//! │                          on N consecutive ticks; Healthy once they stop │
//! │                                                                         │
//! │  CredentialSyncEngine    credential change after every applied merge   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here blocks: emitters are called inline from the sync loops.

use serde::Serialize;
use tracing::{info, warn};

use crate::credentials::CredentialChange;
use crate::link::ConnectionState;

// =============================================================================
// Health
// =============================================================================

/// Why a component reports degraded health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// The broker link failed to reconnect too many times in a row.
    ReconnectCeiling,

    /// The buffer keeps evicting events to stay within capacity.
    BufferOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "health", content = "reason", rename_all = "snake_case")]
pub enum HealthSignal {
    Healthy,
    Degraded(DegradedReason),
}

impl HealthSignal {
    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthSignal::Degraded(_))
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Edge connectivity / sync indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub connection_state: ConnectionState,

    /// Records waiting to be published.
    pub pending: u64,

    /// Records published and awaiting acknowledgment.
    pub in_flight: u64,

    /// Events lost to buffer capacity since start.
    pub evicted_total: u64,

    pub health: HealthSignal,

    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            connection_state: ConnectionState::Disconnected,
            pending: 0,
            in_flight: 0,
            evicted_total: 0,
            health: HealthSignal::Healthy,
            last_error: None,
        }
    }
}

impl SyncStatus {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives status, health and credential notifications.
pub trait StatusEmitter: Send + Sync {
    fn emit_status(&self, status: &SyncStatus);

    fn emit_health(&self, signal: &HealthSignal);

    fn emit_credential_change(&self, change: &CredentialChange);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl StatusEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_health(&self, _signal: &HealthSignal) {}
    fn emit_credential_change(&self, _change: &CredentialChange) {}
}

/// Writes every notification to the log.
pub struct LoggingEmitter;

impl StatusEmitter for LoggingEmitter {
    fn emit_status(&self, status: &SyncStatus) {
        info!(
            state = %status.connection_state,
            pending = status.pending,
            in_flight = status.in_flight,
            evicted = status.evicted_total,
            "Sync status"
        );
    }

    fn emit_health(&self, signal: &HealthSignal) {
        match signal {
            HealthSignal::Healthy => info!("Sync health restored"),
            HealthSignal::Degraded(reason) => warn!(?reason, "Sync health degraded"),
        }
    }

    fn emit_credential_change(&self, change: &CredentialChange) {
        info!(user_id = change.user_id(), version = change.version(), "Credential changed");
    }
}

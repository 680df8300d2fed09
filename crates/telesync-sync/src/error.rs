//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  NotConnected   │  │  MalformedMessage       │ │
//! │  │  MissingDeviceId│  │  ConnectionFail │  │  UnknownTopic           │ │
//! │  │  InvalidUrl     │  │  PublishTimeout │  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │   Credentials   │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  BufferFull     │  │  StaleCredential│  │  ShuttingDown           │ │
//! │  │  DatabaseError  │  │                 │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//! Network and broker failures are absorbed by the broker link (reconnect
//! with backoff) and the publish pipeline (requeue). Only `BufferFull` and
//! the reconnect ceiling surface, as health signals.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for the edge client).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Invalid broker URL.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The broker link is not CONNECTED; the caller retries later.
    #[error("Not connected to broker")]
    NotConnected,

    /// Failed to establish the broker connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connect or subscribe did not finish in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The broker did not acknowledge a publish in time.
    #[error("Publish not acknowledged within {0:?}")]
    PublishTimeout(Duration),

    /// TLS material could not be loaded.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The MQTT client rejected a request.
    #[error("Broker client error: {0}")]
    BrokerError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Inbound payload failed schema validation.
    #[error("Malformed message on '{topic}': {reason}")]
    MalformedMessage { topic: String, reason: String },

    /// Inbound message on a topic outside the configured set.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Failed to serialize an outbound payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The buffer evicted or refused events to stay within capacity.
    #[error("Buffer full: capacity {capacity} reached")]
    BufferFull { capacity: u64 },

    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// Received version is not newer than the local one. Ignored by callers.
    #[error("Stale credential for user {user_id}: local version {local_version}, received {received_version}")]
    StaleCredential {
        user_id: i64,
        local_version: u64,
        received_version: u64,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A component is shutting down.
    #[error("Shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl SyncError {
    /// Shorthand for [`SyncError::MalformedMessage`].
    pub fn malformed(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SyncError::MalformedMessage {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<telesync_db::DbError> for SyncError {
    fn from(err: telesync_db::DbError) -> Self {
        match err {
            telesync_db::DbError::BufferFull { capacity } => SyncError::BufferFull { capacity },
            telesync_db::DbError::InvalidRecord(e) => SyncError::malformed("", e),
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<telesync_core::CoreError> for SyncError {
    fn from(err: telesync_core::CoreError) -> Self {
        match err {
            telesync_core::CoreError::InvalidCredential { user_id, reason } => {
                SyncError::malformed(format!("users/sync/{user_id}"), reason)
            }
            telesync_core::CoreError::Validation(e) => SyncError::malformed("", e),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<rumqttc::ClientError> for SyncError {
    fn from(err: rumqttc::ClientError) -> Self {
        SyncError::BrokerError(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for SyncError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        use rumqttc::ConnectionError as MqttError;
        match err {
            MqttError::ConnectionRefused(code) => {
                SyncError::ConnectionFailed(format!("refused by broker: {code:?}"))
            }
            MqttError::NetworkTimeout | MqttError::FlushTimeout => {
                SyncError::ConnectionFailed("network timeout".into())
            }
            other => SyncError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if this error is recoverable and the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Not connected / connection failures
    /// - Connect and publish timeouts
    /// - Broker client errors (request queue closed during reconnect)
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Malformed payloads
    /// - Stale credentials (nothing to retry)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NotConnected
                | SyncError::ConnectionFailed(_)
                | SyncError::Timeout(_)
                | SyncError::PublishTimeout(_)
                | SyncError::BrokerError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::TlsError(_)
        )
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedMessage { .. }
                | SyncError::UnknownTopic(_)
                | SyncError::SerializationFailed(_)
        )
    }
}

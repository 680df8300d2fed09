//! # telesync-sync: Sync Engine for Telesync
//!
//! Moves telemetry from disconnect-prone edge clients to a central service
//! over an MQTT broker, and credential state back the other way.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Telesync Sync Architecture                       │
//! │                                                                         │
//! │  EDGE (SyncAgent)                      CENTER (CenterNode)              │
//! │  ────────────────                      ───────────────────              │
//! │  capture ─► BufferRepository           BrokerLink                       │
//! │               │                           │ telemetry/data              │
//! │               ▼                           │ system/status/#             │
//! │          PublishPipeline                  ▼                             │
//! │   in-flight window, ack/requeue      DeliveryBridge                     │
//! │               │                      dedup, reorder, fan-out            │
//! │               ▼                           │                             │
//! │          BrokerLink ══════ broker ══════  ▼                             │
//! │               ▲               ▲      BridgeServer (/stream)             │
//! │               │ users/sync/#  │                                         │
//! │      CredentialSyncEngine     └───── CredentialAuthority                │
//! │      last-writer-wins by version     bump, publish retained             │
//! │                                                                         │
//! │  Every loop accepts a shutdown signal; no loop waits on another.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Shared
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Sync error types
//! - [`protocol`] - Topics, payload codec, bridge frames
//! - [`broker`] - Broker session seam and the MQTT implementation
//! - [`link`] - Broker link: connection state machine and reconnect
//! - [`metrics`] - Data-loss and discard counters
//! - [`status`] - Sync indicator, health signals, emitter trait
//! - [`credentials`] - Credential authority (center) and sync engine (edge)
//!
//! ### Edge
//! - [`publisher`] - Publish pipeline draining the buffer
//! - [`agent`] - `SyncAgent` orchestrator
//!
//! ### Center
//! - [`bridge`] - Delivery bridge and its WebSocket endpoint
//! - [`center`] - `CenterNode` composition
//!
//! ## Usage
//!
//! ```rust,ignore
//! use telesync_core::TelemetryValue;
//! use telesync_db::{Database, DbConfig};
//! use telesync_sync::{SyncAgentBuilder, SyncConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let db = Database::new(
//!     DbConfig::new(config.buffer_path()?).buffer_capacity(config.buffer.capacity),
//! )
//! .await?;
//!
//! let agent = SyncAgentBuilder::new(config).with_database(db).build()?.start().await?;
//! agent.capture("pump-1", TelemetryValue::Float(3.2)).await?;
//!
//! let status = agent.status().await;
//! println!("{} pending, {}", status.pending, status.connection_state);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod broker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod link;
pub mod metrics;
pub mod protocol;
pub mod status;

// Edge
pub mod agent;
pub mod publisher;

// Center
pub mod bridge;
pub mod center;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{SyncAgent, SyncAgentBuilder, SyncAgentHandle};
pub use bridge::{
    BridgeHandle, BridgeServer, BridgeServerHandle, BridgeStats, DeliveryBridge, Subscription,
};
pub use broker::{BrokerConnector, BrokerSession, MqttConnector};
pub use center::{CenterHandle, CenterNode};
pub use config::SyncConfig;
pub use credentials::{
    CredentialAuthority, CredentialChange, CredentialHandle, CredentialSyncEngine,
};
pub use error::{SyncError, SyncResult};
pub use link::{AckToken, BrokerLink, ConnectionState, FullJitterBackoff, LinkConfig, LinkHandle};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use protocol::{BridgeEvent, InboundMessage, SubscriptionScope, TopicKind, Topics};
pub use publisher::{PipelineHandle, PublishPipeline};
pub use status::{
    DegradedReason, HealthSignal, LoggingEmitter, NoOpEmitter, StatusEmitter, SyncStatus,
};

//! # telesync-core: Pure Types and Rules for Telesync
//!
//! Everything the edge client and the central service agree on, with zero
//! I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Telesync Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                   telesync-sync (network loops)                 │    │
//! │  │    BrokerLink ──► PublishPipeline ──► DeliveryBridge ──► ...    │    │
//! │  └─────────────────────────────┬───────────────────────────────────┘    │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐    │
//! │  │               ★ telesync-core (THIS CRATE) ★                    │    │
//! │  │                                                                 │    │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐    │    │
//! │  │   │   types   │  │   merge   │  │ ordering  │  │ validation│    │    │
//! │  │   │ Telemetry │  │  LWW by   │  │ per-device│  │  payload  │    │    │
//! │  │   │ Credential│  │  version  │  │ sequence  │  │  checks   │    │    │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘    │    │
//! │  │                                                                 │    │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐    │
//! │  │                telesync-db (Database Layer)                     │    │
//! │  │          Buffer store, credential store, migrations             │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (TelemetryEvent, BufferedRecord, CredentialRecord)
//! - [`merge`] - Version-keyed last-writer-wins merge for credentials
//! - [`ordering`] - Transmission order for buffered batches
//! - [`validation`] - Payload validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use telesync_core::merge::{merge, MergeDecision};
//! use telesync_core::CredentialRecord;
//!
//! let deleted = CredentialRecord::tombstone(7, 4);
//! let late = CredentialRecord::tombstone(7, 3);
//!
//! let (winner, decision) = merge(Some(deleted), late);
//! assert_eq!(winner.version, 4);
//! assert_eq!(decision, MergeDecision::Stale { local_version: 4 });
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod merge;
pub mod ordering;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use merge::MergeDecision;
pub use types::*;

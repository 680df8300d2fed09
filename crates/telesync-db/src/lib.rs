//! # telesync-db: Database Layer for Telesync
//!
//! SQLite storage for the edge client's durable buffer and for credential
//! state on both sides of the broker.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Telesync Data Flow                               │
//! │                                                                         │
//! │  capture ──► PublishPipeline ◄─┐        CredentialSyncEngine            │
//! │                                │                 │                      │
//! │       ▼                        │                 ▼                      │
//! │  ┌─────────────────────────────┴───────────────────────────────────┐    │
//! │  │                   telesync-db (THIS CRATE)                      │    │
//! │  │                                                                 │    │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐   │    │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │   │    │
//! │  │   │   (pool.rs)   │    │                │    │  (embedded)  │   │    │
//! │  │   │               │    │ BufferRepo     │    │ 001_buffer   │   │    │
//! │  │   │ SqlitePool    │◄───│ CredentialRepo │    │ 002_creds    │   │    │
//! │  │   │ WAL + FULL    │    │                │    │              │   │    │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘   │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Buffer and credential repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use telesync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("buffer.db").buffer_capacity(10_000)).await?;
//! db.buffer().recover_in_flight().await?;
//!
//! let (event, _receipt) = db.buffer().capture("D1", 21.5.into()).await?;
//! let batch = db.buffer().mark_in_flight(32).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::buffer::{AppendReceipt, BufferDepth, BufferRepository};
pub use repository::credentials::{CredentialPage, CredentialRepository};

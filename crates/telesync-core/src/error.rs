//! # Error Types
//!
//! Domain-specific error types for telesync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  telesync-core errors (this file)                                       │
//! │  ├── CoreError        - Domain rule violations                          │
//! │  └── ValidationError  - Payload validation failures                     │
//! │                                                                         │
//! │  telesync-db errors (separate crate)                                    │
//! │  └── DbError          - Database operation failures                     │
//! │                                                                         │
//! │  telesync-sync errors (separate crate)                                  │
//! │  └── SyncError        - Broker, pipeline, bridge failures               │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Domain rule violations.
///
/// These are raised before anything touches storage or the network.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A credential record that cannot be applied locally.
    #[error("Credential for user {user_id} rejected: {reason}")]
    InvalidCredential { user_id: i64, reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Payload validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value exceeds what the stores can hold.
    #[error("{field} must be at most {max}")]
    TooLarge { field: String, max: u64 },

    /// Invalid format (e.g., topic metacharacters in an id).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// A value does not match its declared type.
    #[error("{field} declared as {declared} but carries {actual}")]
    TypeMismatch {
        field: String,
        declared: String,
        actual: String,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

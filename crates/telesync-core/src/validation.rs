//! # Validation Module
//!
//! Schema checks applied to inbound broker payloads and to locally
//! captured events before they are buffered.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: Deserialization (serde)                                       │
//! │  └── Shape: required keys, scalar kinds                                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                   │
//! │  ├── device ids usable inside topic names                               │
//! │  ├── value agrees with declared data_type                               │
//! │  └── credential records are internally consistent                       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite constraints (UNIQUE event_id, NOT NULL)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use telesync_core::validation::validate_device_id;
//!
//! assert!(validate_device_id("sensor-01").is_ok());
//! assert!(validate_device_id("bad/id").is_err());
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{CredentialRecord, TelemetryEvent};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum device id length.
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Largest sequence or version the stores accept (SQLite INTEGER).
pub const MAX_STORED_COUNTER: u64 = i64::MAX as u64;

fn check_stored_counter(field: &str, value: u64) -> ValidationResult<()> {
    if value > MAX_STORED_COUNTER {
        return Err(ValidationError::TooLarge {
            field: field.to_string(),
            max: MAX_STORED_COUNTER,
        });
    }
    Ok(())
}

// =============================================================================
// Telemetry
// =============================================================================

/// Validates a device id.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_DEVICE_ID_LEN`] characters
/// - No MQTT topic metacharacters (`/`, `+`, `#`) or whitespace
pub fn validate_device_id(device_id: &str) -> ValidationResult<()> {
    if device_id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "device_id".to_string(),
        });
    }

    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "device_id".to_string(),
            max: MAX_DEVICE_ID_LEN,
        });
    }

    if device_id
        .chars()
        .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace())
    {
        return Err(ValidationError::InvalidFormat {
            field: "device_id".to_string(),
            reason: "must not contain '/', '+', '#' or whitespace".to_string(),
        });
    }

    Ok(())
}

/// Validates an event and conforms its value to the declared type.
///
/// Returns the normalized event (an integral `float` reading is widened).
pub fn normalize_event(mut event: TelemetryEvent) -> ValidationResult<TelemetryEvent> {
    validate_device_id(&event.device_id)?;
    check_stored_counter("sequence", event.sequence)?;

    let value = event
        .value
        .conform(event.data_type)
        .ok_or_else(|| ValidationError::TypeMismatch {
            field: "value".to_string(),
            declared: event.data_type.to_string(),
            actual: event.value.data_type().to_string(),
        })?;

    if let crate::types::TelemetryValue::Float(f) = value {
        if !f.is_finite() {
            return Err(ValidationError::InvalidFormat {
                field: "value".to_string(),
                reason: "float must be finite".to_string(),
            });
        }
    }

    event.value = value;
    Ok(event)
}

// =============================================================================
// Credentials
// =============================================================================

/// Validates a credential record received from the broker.
///
/// ## Rules
/// - `version` starts at 1 and fits a SQLite INTEGER
/// - a live record carries fields with a non-empty username and hash
/// - a tombstone carries no fields
pub fn validate_credential(record: &CredentialRecord) -> ValidationResult<()> {
    if record.version == 0 {
        return Err(ValidationError::MustBePositive {
            field: "version".to_string(),
        });
    }
    check_stored_counter("version", record.version)?;

    match (&record.fields, record.tombstone) {
        (Some(_), true) => Err(ValidationError::InvalidFormat {
            field: "fields".to_string(),
            reason: "tombstone must not carry fields".to_string(),
        }),
        (None, false) => Err(ValidationError::Required {
            field: "fields".to_string(),
        }),
        (Some(fields), false) => {
            if fields.username.trim().is_empty() {
                return Err(ValidationError::Required {
                    field: "fields.username".to_string(),
                });
            }
            if fields.password_hash.is_empty() {
                return Err(ValidationError::Required {
                    field: "fields.password_hash".to_string(),
                });
            }
            Ok(())
        }
        (None, true) => Ok(()),
    }
}

/// Like [`validate_credential`], attributing the failure to the user.
pub fn check_credential(record: &CredentialRecord) -> CoreResult<()> {
    validate_credential(record).map_err(|e| CoreError::InvalidCredential {
        user_id: record.user_id,
        reason: e.to_string(),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

//! Centralized error types for the bridge core library.
//!
//! Mirrors the error taxonomy in spec.md §7: Validation, TransientIo,
//! PermanentTarget, Protocol, Persistence, Configuration. Ingest and the
//! Mapper never propagate errors upward (they count and drop); this type is
//! used by the Store's mutation API and by Delivery/Supervisor internals.

use thiserror::Error;

/// Trait for error types that provide a stable, machine-readable error code.
///
/// Kept separate from `Display` so the human message can change without
/// breaking callers that match on `code()` (the management API, tests).
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Illegal mapping definition: overlap without override, field
    /// unsupported by device capabilities, out-of-bounds channel/length,
    /// discrete mapping missing a field, unknown template.
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient I/O failure: socket timeout, connection refused, partial
    /// send. Drives retry+backoff at the layer that observed it.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The send target is permanently unusable for this payload: device
    /// disabled/stale/missing IP. Drives dead-letter, never retried.
    #[error("permanent target error: {0}")]
    PermanentTarget(String),

    /// Malformed frame or unrecognized opcode/vector on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Database open, migration, or integrity failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration value or rejected hot reload.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BridgeError {
    /// Returns a machine-readable error code for diagnostics and the
    /// external health/management surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::TransientIo(_) => "transient_io_error",
            Self::PermanentTarget(_) => "permanent_target_error",
            Self::Protocol(_) => "protocol_error",
            Self::Persistence(_) => "persistence_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

impl ErrorCode for BridgeError {
    fn code(&self) -> &'static str {
        BridgeError::code(self)
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Convenient Result alias for bridge-core operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

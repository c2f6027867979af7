//! Error taxonomy for the conductor core runtime.
//!
//! Every error kind named in the specification's error handling design
//! maps to one variant here. `is_recoverable` drives the bounded-retry
//! helpers in [`crate::resilience`]; `severity` drives the level a caller
//! logs at.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds produced by the KV store, bus, and scheduler.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The bus or KV backend is unreachable. Always retryable.
    #[error("transport failure talking to {backend}: {message}")]
    TransportFailure {
        /// `"kv"` or `"bus"`.
        backend: String,
        message: String,
    },

    /// A stream entry could not be decoded as an envelope.
    #[error("failed to parse stream entry on topic {topic}: {message}")]
    ParseFailure { topic: String, message: String },

    /// A subscribed handler returned an error while processing an entry.
    #[error("handler {handler} failed: {message}")]
    HandlerFailure { handler: String, message: String },

    /// An operation exceeded its deadline.
    #[error("operation {operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Optimistic concurrency was lost on a CAS write.
    #[error("CAS conflict on key {key} after {attempts} attempts")]
    CasConflict { key: String, attempts: u32 },

    /// The requested job, execution, or key does not exist.
    #[error("not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    /// The caller supplied an invalid job spec, schedule, or cron
    /// expression. Never retried.
    #[error("validation failed: {message}")]
    ValidationFailure { message: String },

    /// Catch-all for conditions that should never happen in a correctly
    /// running process (poisoned locks, unreachable branches reached).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    /// Build a [`CoreError::TransportFailure`] for the KV backend.
    pub fn kv_transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            backend: "kv".to_string(),
            message: message.into(),
        }
    }

    /// Build a [`CoreError::TransportFailure`] for the bus backend.
    pub fn bus_transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            backend: "bus".to_string(),
            message: message.into(),
        }
    }

    /// Whether local, bounded recovery (retry, re-read-and-retry) applies.
    ///
    /// Mirrors spec.md §7's propagation table: transport failures, CAS
    /// conflicts, and parse failures recover locally; handler failures,
    /// timeouts, not-found, and validation failures are surfaced.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TransportFailure { .. } | Self::CasConflict { .. }
        )
    }

    /// Severity bucket used to pick a `tracing` level when logging.
    pub fn severity(&self) -> &'static str {
        match self {
            Self::Internal { .. } => "critical",
            Self::HandlerFailure { .. } | Self::Timeout { .. } => "error",
            Self::TransportFailure { .. } | Self::CasConflict { .. } => "warning",
            Self::ParseFailure { .. } | Self::NotFound { .. } | Self::ValidationFailure { .. } => {
                "info"
            }
        }
    }
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        CoreError::kv_transport(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::ParseFailure {
            topic: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_cas_are_recoverable() {
        assert!(CoreError::kv_transport("down").is_recoverable());
        assert!(CoreError::CasConflict {
            key: "k".into(),
            attempts: 1
        }
        .is_recoverable());
    }

    #[test]
    fn validation_and_not_found_are_not_recoverable() {
        assert!(!CoreError::ValidationFailure {
            message: "bad cron".into()
        }
        .is_recoverable());
        assert!(!CoreError::NotFound {
            kind: "job".into(),
            id: "j1".into()
        }
        .is_recoverable());
    }

    #[test]
    fn severity_buckets() {
        assert_eq!(
            CoreError::Internal {
                message: "oops".into()
            }
            .severity(),
            "critical"
        );
        assert_eq!(
            CoreError::ValidationFailure {
                message: "x".into()
            }
            .severity(),
            "info"
        );
    }
}

//! Error types for the deduplication core.
//!
//! A failed `is_duplicate` call means "unknown", never "not a duplicate": callers get an
//! `Err` and must not read it as `false`.

use std::time::Duration;

/// Errors returned by a membership store binding.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// Filter reservation hit a filter that already exists under that key.
    #[error("filter {0:?} already exists")]
    FilterExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by fingerprinting, repositories and the deduplicator.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialize value: {0}")]
    Serialization(String),

    #[error("fingerprint: {0}")]
    Fingerprint(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("{operation} is not supported by the {strategy} strategy")]
    Unsupported {
        operation: &'static str,
        strategy: &'static str,
    },
}

impl DedupError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DedupError::Config(_) => "config",
            DedupError::Serialization(_) => "serialization",
            DedupError::Fingerprint(_) => "fingerprint",
            DedupError::Store(_) => "store",
            DedupError::Timeout(_) => "timeout",
            DedupError::InvalidPayload(_) => "invalid_payload",
            DedupError::Unsupported { .. } => "unsupported",
        }
    }
}

pub type Result<T, E = DedupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_and_keeps_message() {
        let e: DedupError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(e.kind(), "store");
        assert_eq!(e.to_string(), "store unavailable: connection refused");
    }

    #[test]
    fn unsupported_message_names_strategy() {
        let e = DedupError::Unsupported {
            operation: "forget",
            strategy: "bloom",
        };
        assert_eq!(e.to_string(), "forget is not supported by the bloom strategy");
        assert_eq!(e.kind(), "unsupported");
    }
}

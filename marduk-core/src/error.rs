//! Error taxonomy for the coordination core.
//!
//! Adapters and sources never surface these to the source manager (they log
//! and return empty); the coordinator is the only component that propagates
//! typed errors to callers.

/// Result type alias for marduk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the coordination core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed items, queries, or AI requests. Raised at the boundary and
    /// never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistence I/O failure on a memory or context store.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Checksum mismatch or corrupted persisted state.
    #[error("Data integrity error: {0}")]
    Integrity(String),

    /// LLM request or interaction-storage failure.
    #[error("AI API error: {0}")]
    Api(String),

    /// Context retrieval failed after all sources errored out.
    #[error("Context retrieval error: {0}")]
    ContextRetrieval(String),

    /// Catch-all wrapper for query processing failures.
    #[error("PROCESS_QUERY_ERROR: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Api(_) | Error::Persistence(_) | Error::Timeout | Error::Io(_) => true,
            Error::Validation(_)
            | Error::Integrity(_)
            | Error::ContextRetrieval(_)
            | Error::Process(_)
            | Error::Configuration(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Wrap any failure from the query pipeline, leaving already-typed AI
    /// errors untouched.
    #[must_use]
    pub fn into_process_error(self) -> Error {
        match self {
            Error::Api(_) | Error::ContextRetrieval(_) | Error::Process(_) => self,
            other => Error::Process(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Api("rate limited".into()).is_recoverable());
        assert!(Error::Persistence("disk full".into()).is_recoverable());
        assert!(Error::Timeout.is_recoverable());
        assert!(!Error::Validation("bad item".into()).is_recoverable());
        assert!(!Error::Process("wrapped".into()).is_recoverable());
    }

    #[test]
    fn test_process_wrapping_preserves_typed_errors() {
        let api = Error::Api("outage".into()).into_process_error();
        assert!(matches!(api, Error::Api(_)));

        let ctx = Error::ContextRetrieval("all sources failed".into()).into_process_error();
        assert!(matches!(ctx, Error::ContextRetrieval(_)));

        let wrapped = Error::Validation("bad".into()).into_process_error();
        assert!(matches!(wrapped, Error::Process(_)));
    }

    #[test]
    fn test_display_carries_code() {
        let err = Error::Process("boom".into());
        assert!(err.to_string().contains("PROCESS_QUERY_ERROR"));
    }
}

//! Agent error types.
//!
//! All subsystems surface failures through [`AgentError`].  Two predicates
//! drive control flow elsewhere in the crate: [`AgentError::is_retryable`]
//! (consulted by the retry wrapper) and [`AgentError::is_cancellation`]
//! (consulted by the agent loop so a cancelled turn is reported as a normal
//! early return rather than a crash).

/// Unified error type for the agent core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// No API key could be found for a provider that requires one.
    ///
    /// Permanent: surfaced immediately, never retried.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    /// An HTTP request to the provider failed at the transport level.
    ///
    /// `transient` is set for connect failures, timeouts, and connection
    /// resets; those are fair game for the retry wrapper.
    #[error("provider request failed: {reason}")]
    RequestFailed { reason: String, transient: bool },

    /// The provider answered with a non-success status code.
    #[error("provider returned {status}: {body}")]
    ApiStatus { status: u16, body: String },

    /// The streaming connection was interrupted or produced invalid bytes
    /// after it had been established.
    #[error("provider stream error: {reason}")]
    StreamFailed { reason: String },

    /// The provider response could not be parsed into the normalized model.
    #[error("provider response parse error: {reason}")]
    ParseFailed { reason: String },

    /// The compaction model returned something unusable as a summary.
    #[error("summarization failed: {reason}")]
    Summarization { reason: String },

    /// The operation was cancelled via the agent's cancellation handle.
    ///
    /// Not a failure.  Callers check [`AgentError::is_cancellation`] and turn
    /// this into a normal early return.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether the retry wrapper may re-attempt the failed call.
    ///
    /// Matches the transient set: HTTP 429/500/503, connection resets, and
    /// timeouts.  Everything else propagates unchanged on first failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ApiStatus { status, .. } => matches!(status, 429 | 500 | 503),
            Self::RequestFailed { transient, .. } => *transient,
            Self::StreamFailed { .. } => true,
            _ => false,
        }
    }

    /// Whether this error is the cooperative-cancellation marker.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        let reason = err.to_string();
        let transient =
            err.is_timeout() || err.is_connect() || reason.contains("connection reset");
        Self::RequestFailed { reason, transient }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        for status in [429u16, 500, 503] {
            let err = AgentError::ApiStatus {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        for status in [400u16, 401, 404, 422] {
            let err = AgentError::ApiStatus {
                status,
                body: String::new(),
            };
            assert!(!err.is_retryable(), "{status} should not be retryable");
        }
    }

    #[test]
    fn missing_key_is_permanent() {
        let err = AgentError::MissingApiKey {
            provider: "anthropic".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn transient_transport_failures_are_retryable() {
        let err = AgentError::RequestFailed {
            reason: "connect timed out".into(),
            transient: true,
        };
        assert!(err.is_retryable());

        let err = AgentError::RequestFailed {
            reason: "body decode".into(),
            transient: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn cancellation_is_neither_retryable_nor_a_failure_class() {
        let err = AgentError::Cancelled;
        assert!(err.is_cancellation());
        assert!(!err.is_retryable());
    }
}

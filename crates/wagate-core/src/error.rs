use thiserror::Error;

/// Top-level error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// User input violates the expected schema (HTTP 400).
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity id unknown (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Human-behavior or provider throttling (HTTP 429; retried for sends).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Recoverable client failure (detached frame, timeout, reconnect needed).
    #[error("transient client error: {0}")]
    TransientClient(String),

    /// Unrecoverable client failure (invalid target, auth failure).
    #[error("client error: {0}")]
    TerminalClient(String),

    /// Store connectivity, constraint, or timeout failure.
    #[error("store error: {0}")]
    Store(String),

    /// In-flight work cancelled by graceful shutdown.
    #[error("shutdown in progress")]
    Shutdown,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Whether the send worker should retry after this error.
    ///
    /// Transient client failures and provider throttling are retried;
    /// everything else resolves the send terminally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientClient(_) | GatewayError::RateLimited(_)
        )
    }
}

/// Substrings that mark a client send failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "detached frame",
    "execution context was destroyed",
    "connection reset",
    "timeout",
    "timed out",
    "not ready",
    "reconnect",
];

/// Classify a raw client error message into the gateway taxonomy.
///
/// Provider throttling ("rate limit") is kept distinct from other
/// transient failures so the send worker can apply a longer backoff floor.
pub fn classify_client_error(raw: &str) -> GatewayError {
    let lower = raw.to_lowercase();
    if lower.contains("rate limit") {
        return GatewayError::RateLimited(raw.to_string());
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return GatewayError::TransientClient(raw.to_string());
    }
    GatewayError::TerminalClient(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_frame_is_transient() {
        let err = classify_client_error("Protocol error: detached Frame");
        assert!(matches!(err, GatewayError::TransientClient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn destroyed_context_is_transient() {
        let err = classify_client_error("Execution context was destroyed");
        assert!(err.is_retryable());
    }

    #[test]
    fn provider_rate_limit_is_its_own_kind() {
        let err = classify_client_error("provider said: rate limit exceeded");
        assert!(matches!(err, GatewayError::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_errors_are_terminal() {
        let err = classify_client_error("invalid wid");
        assert!(matches!(err, GatewayError::TerminalClient(_)));
        assert!(!err.is_retryable());
    }
}

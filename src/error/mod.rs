//! Error types for agentgate.

use thiserror::Error;

/// Primary error type for all gateway-core operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream buffer overflow: {buffered} bytes without a line break")]
    StreamOverflow { buffered: usize },

    #[error("Circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    #[error("Tool execution error: {tool_name} — {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider error: {provider} — {message}")]
    Provider { provider: String, message: String },
}

impl AgentError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Whether this error is worth retrying with backoff.
    ///
    /// Configuration and authentication problems are fatal; transient
    /// provider failures (rate limits, timeouts, 5xx, network) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => {
                *status == 408 || *status == 429 || (500..=599).contains(status)
            }
            _ => false,
        }
    }

    /// HTTP-like status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Timeout(_) => Some(408),
            _ => None,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        assert!(AgentError::api(500, "boom").is_retryable());
        assert!(AgentError::api(503, "unavailable").is_retryable());
        assert!(AgentError::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(AgentError::Timeout(1000).is_retryable());
    }

    #[test]
    fn config_and_auth_errors_are_fatal() {
        assert!(!AgentError::Authentication("missing key".into()).is_retryable());
        assert!(!AgentError::Configuration("bad".into()).is_retryable());
        assert!(!AgentError::api(400, "bad request").is_retryable());
        assert!(!AgentError::api(404, "not found").is_retryable());
    }
}

//! Gateway error taxonomy.
//!
//! Validation/routing errors short-circuit before any upstream call; transport
//! errors are retried per the retry policy and then handed to graceful
//! degradation; degradation failures propagate as a 503-equivalent with a
//! retry-after hint.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Body could not be parsed in the detected protocol. Terminal, 4xx.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Routing miss. Terminal, 4xx, never retried.
    #[error("Unsupported model: {model}")]
    UnsupportedModel { model: String },

    /// Transport/HTTP failure from a provider adapter.
    #[error("Provider call failed ({provider_error_type}): {message}")]
    ProviderCall {
        /// HTTP status if the provider answered, 0 for pure transport faults.
        status: u16,
        provider_error_type: String,
        message: String,
    },

    /// Fail-fast synthetic error emitted while a circuit is open.
    #[error("Circuit open for {key}, retry after {retry_after_ms}ms")]
    CircuitOpen { key: String, retry_after_ms: u64 },

    /// Raised by the `service_unavailable` degradation strategy only.
    #[error("Service unavailable, retry after {retry_after_secs}s")]
    DegradationExhausted { retry_after_secs: u64 },
}

impl GatewayError {
    pub fn provider_call(status: u16, error_type: &str, message: impl Into<String>) -> Self {
        GatewayError::ProviderCall {
            status,
            provider_error_type: error_type.to_string(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::provider_call(0, "transport", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::provider_call(0, "timeout", message)
    }

    /// Retry classification: transport faults, timeouts, conflicts and
    /// provider 5xx/429 are retryable; validation, auth, routing misses and
    /// open circuits are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::ProviderCall {
                status,
                provider_error_type,
                ..
            } => match provider_error_type.as_str() {
                "transport" | "timeout" | "conflict" | "throttled" => true,
                _ => matches!(status, 408 | 409 | 429 | 500 | 502 | 503 | 504),
            },
            GatewayError::MalformedRequest(_)
            | GatewayError::UnsupportedModel { .. }
            | GatewayError::CircuitOpen { .. }
            | GatewayError::DegradationExhausted { .. } => false,
        }
    }

    /// HTTP status the gateway surfaces for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::MalformedRequest(_) => 400,
            GatewayError::UnsupportedModel { .. } => 404,
            GatewayError::ProviderCall { status, .. } => {
                if (400..500).contains(status) {
                    *status
                } else {
                    502
                }
            }
            GatewayError::CircuitOpen { .. } | GatewayError::DegradationExhausted { .. } => 503,
        }
    }

    /// Stable machine-readable code, used in both protocol error shapes.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MalformedRequest(_) => "invalid_request_error",
            GatewayError::UnsupportedModel { .. } => "model_not_found",
            GatewayError::ProviderCall { .. } => "upstream_error",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::DegradationExhausted { .. } => "service_unavailable",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::CircuitOpen { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            GatewayError::DegradationExhausted { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            GatewayError::provider_call(status.as_u16(), "http", err.to_string())
        } else {
            GatewayError::transport(err.to_string())
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

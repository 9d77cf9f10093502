use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Redis connection error: {0}")]
    RedisConnectionError(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    RedisPoolError(String),

    #[error("Script execution error: {0}")]
    ScriptExecutionError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Policy source error: {0}")]
    PolicySourceError(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(#[from] reqwest::Error),

    #[error("Kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),

    #[error("Storage error: {0}")]
    StorageError(#[from] sqlx::Error),

    #[error("Duplicate audit record for request_id {0}")]
    DuplicateRecord(String),

    #[error("File system error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl QuotaError {
    /// Stable error code exposed in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::InvalidRequest(_) => "INVALID_ARGUMENT",
            QuotaError::InvalidPolicy(_) => "INVALID_POLICY",
            QuotaError::DuplicateRecord(_) => "DUPLICATE_REQUEST",
            QuotaError::RedisConnectionError(_)
            | QuotaError::RedisPoolError(_)
            | QuotaError::Timeout(_)
            | QuotaError::PolicySourceError(_)
            | QuotaError::HttpClientError(_)
            | QuotaError::KafkaError(_) => "UPSTREAM_UNAVAILABLE",
            _ => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            QuotaError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            QuotaError::ConfigurationError(_) => "configuration",
            QuotaError::InvalidPolicy(_) => "invalid_policy",
            QuotaError::InvalidRequest(_) => "invalid_request",
            QuotaError::RedisConnectionError(_) => "redis_connection",
            QuotaError::RedisPoolError(_) => "redis_pool",
            QuotaError::ScriptExecutionError(_) => "script",
            QuotaError::Timeout(_) => "timeout",
            QuotaError::PolicySourceError(_) => "policy_source",
            QuotaError::HttpClientError(_) => "http_client",
            QuotaError::KafkaError(_) => "kafka",
            QuotaError::StorageError(_) => "storage",
            QuotaError::DuplicateRecord(_) => "duplicate",
            QuotaError::FileSystemError(_) => "file_system",
            QuotaError::JsonError(_) => "json",
            QuotaError::InternalError(_) => "internal",
        }
    }
}

/// Result type alias for quota operations
pub type Result<T> = std::result::Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_requests_are_client_errors() {
        assert_eq!(
            QuotaError::InvalidRequest("tokens".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            QuotaError::Timeout("redis".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            QuotaError::InternalError("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_failures_share_a_code() {
        assert_eq!(QuotaError::Timeout("x".into()).code(), "UPSTREAM_UNAVAILABLE");
        assert_eq!(QuotaError::RedisPoolError("x".into()).code(), "UPSTREAM_UNAVAILABLE");
        assert_eq!(QuotaError::DuplicateRecord("r".into()).code(), "DUPLICATE_REQUEST");
    }
}

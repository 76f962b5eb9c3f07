use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types for Trove.
#[derive(Error, Debug)]
pub enum AppError {
    /// The scrape request is malformed and was rejected before a job existed.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Unknown job id on status/cancel.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Every identity is checked out or cooling down.
    #[error("Identity pool exhausted")]
    PoolExhausted,

    /// Every identity is retired (or the pool is empty); no fetch can proceed.
    #[error("No usable identities in pool")]
    NoUsableIdentities,

    /// The remote surface rejected the request as automated traffic.
    #[error("Blocked by source (status {status_code:?}): {reason}")]
    Blocked {
        status_code: Option<u16>,
        reason: String,
    },

    /// HTTP request failed (non-success status, bad URL, unreadable body).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// A page could not be parsed into candidates.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Image download or normalisation failed.
    #[error("Image error: {0}")]
    ImageError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error indicates the source flagged us as a bot.
    pub fn is_block_signal(&self) -> bool {
        match self {
            AppError::Blocked { .. } => true,
            AppError::HttpError(msg) => msg.contains("HTTP 403") || msg.contains("HTTP 429"),
            _ => false,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::PoolExhausted => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout")
                    || msg.contains("connect")
                    || msg.contains("reset")
                    || msg.contains("HTTP 5")
            }
            _ => false,
        }
    }
}

/// Terminal outcome of a unit of work that could not produce candidates.
///
/// Never surfaced to callers; the scheduler only aggregates these into the
/// owning job's error count.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("blocked on every attempt ({attempts} attempts)")]
    Blocked { attempts: u32 },

    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("non-retryable failure: {0}")]
    Fatal(String),

    #[error("no usable identities")]
    NoIdentities,

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Counts towards the job's failure ratio.
    pub fn is_terminal_failure(&self) -> bool {
        !matches!(self, FetchError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_signals() {
        assert!(
            AppError::Blocked {
                status_code: Some(403),
                reason: "forbidden".into()
            }
            .is_block_signal()
        );
        assert!(AppError::HttpError("HTTP 429 for https://a.test".into()).is_block_signal());
        assert!(!AppError::HttpError("HTTP 404 for https://a.test".into()).is_block_signal());
        assert!(!AppError::Timeout(30).is_block_signal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::HttpError("HTTP 503 for https://a.test".into()).is_retryable());
        assert!(!AppError::ParseError("bad json".into()).is_retryable());
        assert!(
            !AppError::Blocked {
                status_code: None,
                reason: "captcha".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_cancelled_is_not_a_failure() {
        assert!(!FetchError::Cancelled.is_terminal_failure());
        assert!(FetchError::Blocked { attempts: 4 }.is_terminal_failure());
        assert!(FetchError::NoIdentities.is_terminal_failure());
    }
}

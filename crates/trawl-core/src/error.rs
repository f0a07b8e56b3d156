use thiserror::Error;

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// Non-success HTTP status (or an unusable response) while fetching a page.
    #[error("HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    /// The target was confirmed not to exist (404/410 or equivalent).
    #[error("Target not found: {0}")]
    NotFound(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Remote side asked us to slow down.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The fetcher itself is unusable (client or browser session died).
    #[error("Fetcher unusable: {0}")]
    FetcherFatal(String),

    /// Page content did not match the extraction rules.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Reading or writing the persisted cache failed.
    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    /// Writing to the result sink failed.
    #[error("Sink error: {0}")]
    SinkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A target identifier could not be turned into a fetchable URL.
    #[error("Invalid target '{0}'")]
    InvalidTarget(String),

    /// The run was cancelled while the operation was blocked.
    #[error("Cancelled")]
    Cancelled,
}

/// How the worker reacts to a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorClass {
    /// Worth another attempt after backoff.
    Retryable,
    /// The target will never succeed; record and move on.
    Permanent,
    /// The fetcher must be recreated before it is used again.
    Fatal,
}

impl AppError {
    /// Classifies an error returned by a page fetcher.
    pub fn fetch_class(&self) -> FetchErrorClass {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::Cancelled => FetchErrorClass::Retryable,
            AppError::HttpError { status, .. } => {
                if *status >= 500 || *status == 408 || *status == 429 {
                    FetchErrorClass::Retryable
                } else {
                    FetchErrorClass::Permanent
                }
            }
            AppError::FetcherFatal(_) => FetchErrorClass::Fatal,
            _ => FetchErrorClass::Permanent,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.fetch_class() == FetchErrorClass::Retryable
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::CacheIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(
            AppError::HttpError {
                status: 503,
                message: "unavailable".into(),
            }
            .is_retryable()
        );
        assert!(!AppError::NotFound("gone/away".into()).is_retryable());
    }

    #[test]
    fn test_fetch_classification() {
        assert_eq!(
            AppError::NotFound("x".into()).fetch_class(),
            FetchErrorClass::Permanent
        );
        assert_eq!(
            AppError::HttpError {
                status: 403,
                message: "forbidden".into(),
            }
            .fetch_class(),
            FetchErrorClass::Permanent
        );
        assert_eq!(
            AppError::HttpError {
                status: 429,
                message: "slow down".into(),
            }
            .fetch_class(),
            FetchErrorClass::Retryable
        );
        assert_eq!(
            AppError::FetcherFatal("driver crashed".into()).fetch_class(),
            FetchErrorClass::Fatal
        );
    }

    #[test]
    fn test_io_errors_become_cache_io() {
        let err: AppError = std::io::Error::other("disk full").into();
        assert!(matches!(err, AppError::CacheIo(_)));
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type alias for Result with MailboxError
pub type Result<T> = std::result::Result<T, MailboxError>;

/// Classification tag attached to every remote failure
///
/// The engine decides what is ignorable from this tag alone and never
/// inspects service-specific status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// HTTP 429 or a quota rejection
    RateLimited,
    /// HTTP 5xx or a dropped connection
    ServerTransient,
    /// HTTP 400 that the remote service returns spuriously under load
    BadRequestBug,
    /// Anything else
    Other,
}

impl ErrorClass {
    /// Whether a per-item failure of this class may be left pending and retried later
    pub fn is_ignorable(&self) -> bool {
        !matches!(self, ErrorClass::Other)
    }
}

/// Logical phase of the cleanup loop, used to attribute consecutive failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Listing,
    Fetching,
    Deleting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Listing => write!(f, "listing"),
            Phase::Fetching => write!(f, "batch-get"),
            Phase::Deleting => write!(f, "batch-delete"),
        }
    }
}

/// Error types for the mailbox cleanup system
#[derive(Error, Debug)]
pub enum MailboxError {
    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Label lookup failed
    #[error("Label error: {0}")]
    LabelError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// State management errors
    #[error("State error: {0}")]
    StateError(String),

    /// The client-side limiter refused the call on every attempt
    #[error("{operation} was throttled on all {attempts} attempts")]
    ThrottleExhausted { operation: String, attempts: u32 },

    /// A phase failed too many times in a row
    #[error("{phase} failed {attempts} consecutive times, last error: {last_error}")]
    RetriesExhausted {
        phase: Phase,
        attempts: u32,
        last_error: String,
    },

    /// A single message fetch failed with a non-ignorable error
    #[error("Fetching message {id} failed: {source}")]
    MessageFetchFailed {
        id: String,
        #[source]
        source: Box<MailboxError>,
    },
}

impl MailboxError {
    /// Classification tag for this error
    pub fn class(&self) -> ErrorClass {
        match self {
            MailboxError::RateLimitExceeded { .. } => ErrorClass::RateLimited,
            MailboxError::ServerError { .. } | MailboxError::NetworkError(_) => {
                ErrorClass::ServerTransient
            }
            MailboxError::BadRequest(_) => ErrorClass::BadRequestBug,
            _ => ErrorClass::Other,
        }
    }

    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        self.class().is_ignorable()
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 5 seconds.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    if let Some(retry_after_value) = response.headers().get("retry-after") {
        if let Ok(retry_after_str) = retry_after_value.to_str() {
            if let Ok(seconds) = retry_after_str.parse::<u64>() {
                return seconds;
            }

            if let Ok(http_date) = httpdate::parse_http_date(retry_after_str) {
                let now = std::time::SystemTime::now();
                if let Ok(duration) = http_date.duration_since(now) {
                    return duration.as_secs();
                }
            }
        }
    }

    DEFAULT_RETRY_AFTER
}

impl From<google_gmail1::Error> for MailboxError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => {
                        let retry_after = parse_retry_after_header(response);
                        MailboxError::RateLimitExceeded { retry_after }
                    }
                    404 => MailboxError::MessageNotFound("Resource not found".to_string()),
                    400 => MailboxError::BadRequest(message),
                    403 => MailboxError::Forbidden(message),
                    500..=599 => MailboxError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => MailboxError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => MailboxError::BadRequest(format!("{}", err)),
            google_gmail1::Error::HttpError(ref err) => {
                MailboxError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => MailboxError::NetworkError(err.to_string()),
            _ => MailboxError::ApiError(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            MailboxError::RateLimitExceeded { retry_after: 5 }.class(),
            ErrorClass::RateLimited
        );
        assert_eq!(
            MailboxError::ServerError {
                status: 500,
                message: "Internal error".to_string(),
            }
            .class(),
            ErrorClass::ServerTransient
        );
        assert_eq!(
            MailboxError::NetworkError("reset".to_string()).class(),
            ErrorClass::ServerTransient
        );
        assert_eq!(
            MailboxError::BadRequest("Invalid id".to_string()).class(),
            ErrorClass::BadRequestBug
        );
        assert_eq!(
            MailboxError::Forbidden("Access denied".to_string()).class(),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_ignorable_set() {
        assert!(ErrorClass::RateLimited.is_ignorable());
        assert!(ErrorClass::ServerTransient.is_ignorable());
        assert!(ErrorClass::BadRequestBug.is_ignorable());
        assert!(!ErrorClass::Other.is_ignorable());
    }

    #[test]
    fn test_engine_errors_are_not_transient() {
        let throttled = MailboxError::ThrottleExhausted {
            operation: "list".to_string(),
            attempts: 16,
        };
        assert!(!throttled.is_transient());

        let exhausted = MailboxError::RetriesExhausted {
            phase: Phase::Listing,
            attempts: 4,
            last_error: "HTTP 500".to_string(),
        };
        assert!(!exhausted.is_transient());
        assert!(exhausted.to_string().contains("listing failed 4 consecutive times"));
    }

    #[test]
    fn test_error_display() {
        let error = MailboxError::RateLimitExceeded { retry_after: 10 };
        let display = format!("{}", error);
        assert!(display.contains("Rate limit exceeded"));
        assert!(display.contains("10 seconds"));

        let fetch = MailboxError::MessageFetchFailed {
            id: "m1".to_string(),
            source: Box::new(MailboxError::Forbidden("nope".to_string())),
        };
        assert!(fetch.to_string().contains("m1"));
    }

    #[test]
    fn test_parse_retry_after_header_integer() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_static("120"),
        );

        assert_eq!(parse_retry_after_header(&response), 120);
    }

    #[test]
    fn test_parse_retry_after_header_missing() {
        let response = hyper::Response::builder().status(429).body(()).unwrap();
        assert_eq!(parse_retry_after_header(&response), 5);
    }

    #[test]
    fn test_parse_retry_after_header_invalid() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_static("invalid"),
        );

        assert_eq!(parse_retry_after_header(&response), 5);
    }

    #[test]
    fn test_parse_retry_after_header_http_date() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();

        let future_time = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let http_date = httpdate::fmt_http_date(future_time);

        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_str(&http_date).unwrap(),
        );

        let retry_after = parse_retry_after_header(&response);
        assert!(
            (58..=61).contains(&retry_after),
            "Expected ~60, got {}",
            retry_after
        );
    }
}

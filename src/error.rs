use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the crawl engine
#[derive(Debug, Error)]
pub enum Error {
    /// The site's exclusion policy forbids automated access
    #[error("URL is not allowed by robots.txt: {url}")]
    PolicyDenied { url: String },

    /// Navigation failed, timed out or returned a non-success status
    #[error("failed to load {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The rendering backend failed or is unavailable
    #[error("rendering backend error: {0}")]
    Backend(String),

    /// The shared rendering session was released and cannot be reopened
    #[error("rendering backend error: rendering session closed")]
    SessionClosed,

    /// Malformed cron expression, job config or engine config
    #[error("validation error: {0}")]
    Validation(String),

    /// Job, result or work-unit store failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A stored record does not exist
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// The client exceeded its requests-per-minute allowance
    #[error("rate limit exceeded for {client_id}, retry in {}s", .retry_after.as_secs_f64().ceil().max(1.0))]
    RateLimitExceeded {
        client_id: String,
        retry_after: Duration,
    },
}

impl Error {
    /// Stable classification string carried into error records
    pub fn kind(&self) -> &'static str {
        match self {
            Error::PolicyDenied { .. } => "policy_denied",
            Error::Fetch { .. } => "fetch_error",
            Error::Backend(_) | Error::SessionClosed => "backend_error",
            Error::Validation(_) => "validation_error",
            Error::Persistence(_) | Error::NotFound { .. } => "persistence_error",
            Error::RateLimitExceeded { .. } => "rate_limit_exceeded",
        }
    }

    /// Whether the failure may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Fetch { .. } | Error::Backend(_))
    }

    pub(crate) fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Collects the error and its `source()` chain, outermost first
    pub fn trace(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        chain
    }
}

impl From<fantoccini::error::CmdError> for Error {
    fn from(err: fantoccini::error::CmdError) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<fantoccini::error::NewSessionError> for Error {
    fn from(err: fantoccini::error::NewSessionError) -> Self {
        Error::Backend(format!("failed to create WebDriver session: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Validation(format!("invalid URL: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            Error::PolicyDenied {
                url: "https://example.com".into()
            }
            .kind(),
            "policy_denied"
        );
        assert_eq!(Error::fetch("u", "timeout").kind(), "fetch_error");
        assert_eq!(Error::not_found("job", "j1").kind(), "persistence_error");
    }

    #[test]
    fn test_only_fetch_and_backend_are_retryable() {
        assert!(Error::fetch("u", "status 503").is_retryable());
        assert!(Error::Backend("lost session".into()).is_retryable());
        assert!(!Error::Validation("bad cron".into()).is_retryable());
        assert!(!Error::SessionClosed.is_retryable());
        assert_eq!(Error::SessionClosed.kind(), "backend_error");
        assert!(
            !Error::PolicyDenied {
                url: "https://example.com".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_rate_limit_message_rounds_up() {
        let err = Error::RateLimitExceeded {
            client_id: "10.0.0.1".into(),
            retry_after: Duration::from_millis(300),
        };
        assert_eq!(
            err.to_string(),
            "rate limit exceeded for 10.0.0.1, retry in 1s"
        );

        let err = Error::RateLimitExceeded {
            client_id: "10.0.0.1".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(
            err.to_string(),
            "rate limit exceeded for 10.0.0.1, retry in 2s"
        );
    }
}

//! Error types for the tcproxy crate.

use thiserror::Error;

/// Errors that can occur in the authenticating proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid endpoint path: {path:?}")]
    InvalidEndpoint { path: String },

    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("Bewit not issuable: {0}")]
    BewitIneligible(String),

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Upstream I/O failure: {0}")]
    UpstreamIo(std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether the outbound call that produced this error may be retried
    /// with a fresh signature. Only transport-level failures qualify;
    /// HTTP-level responses from the backend are never retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamConnect { .. } | ProxyError::UpstreamIo(_)
        )
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = ProxyError::UpstreamConnect {
            host: "queue.example.com".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.is_transient());

        let err = ProxyError::InvalidEndpoint {
            path: "/x@/".to_string(),
        };
        assert!(!err.is_transient());

        let err = ProxyError::MalformedCredential("bad certificate".to_string());
        assert!(!err.is_transient());
    }
}

//! Error types for the ICSD service client.
//!
//! This module defines structured errors for every remote call, carrying the
//! endpoint URL so failures can be traced back to the request that caused them.

use thiserror::Error;

/// Errors that can occur while talking to the ICSD web service.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error calling {url}: {source}")]
    Network {
        /// The endpoint that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout calling {url}")]
    Timeout {
        /// The endpoint that timed out.
        url: String,
    },

    /// Non-success HTTP response other than a token rejection.
    #[error("HTTP {status} calling {url}")]
    HttpStatus {
        /// The endpoint that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The service answered 401: the auth token is invalid or expired.
    #[error("[AUTH] token rejected by {url}")]
    TokenRejected {
        /// The endpoint that rejected the token.
        url: String,
    },

    /// The response arrived but did not have the expected shape.
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        /// The endpoint that produced the response.
        url: String,
        /// What was missing or unexpected.
        reason: String,
    },

    /// The configured base URL cannot be joined with an endpoint path.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// The underlying HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    Build {
        /// The builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl ClientError {
    /// Creates a network error from a reqwest error, mapping timeouts to [`ClientError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error, mapping 401 to [`ClientError::TokenRejected`].
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        if status == 401 {
            Self::TokenRejected { url: url.into() }
        } else {
            Self::HttpStatus {
                url: url.into(),
                status,
            }
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a malformed-response error.
    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns true when the service rejected the auth token.
    #[must_use]
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::TokenRejected { .. })
    }

    /// Returns the HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::TokenRejected { .. } => Some(401),
            _ => None,
        }
    }
}

// No From<reqwest::Error>: every variant needs the endpoint URL, which the
// source error does not reliably carry. Use the constructors above.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_timeout_display() {
        let error = ClientError::timeout("https://icsd.example/ws/csv");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://icsd.example/ws/csv"));
    }

    #[test]
    fn test_http_status_401_becomes_token_rejected() {
        let error = ClientError::http_status("https://icsd.example/ws/search/expert", 401);
        assert!(error.is_token_rejected());
        assert_eq!(error.status(), Some(401));
        assert!(error.to_string().starts_with("[AUTH]"));
    }

    #[test]
    fn test_http_status_display() {
        let error = ClientError::http_status("https://icsd.example/ws/cif/multiple", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "Expected '503' in: {msg}");
        assert!(msg.contains("cif/multiple"), "Expected URL in: {msg}");
        assert!(!error.is_token_rejected());
    }

    #[test]
    fn test_malformed_display_carries_reason() {
        let error = ClientError::malformed("https://icsd.example/ws/csv", "empty body");
        let msg = error.to_string();
        assert!(msg.contains("malformed"), "Expected 'malformed' in: {msg}");
        assert!(msg.contains("empty body"), "Expected reason in: {msg}");
        assert_eq!(error.status(), None);
    }

    #[test]
    fn test_invalid_url_display() {
        let error = ClientError::invalid_url("not a url");
        assert!(error.to_string().contains("invalid URL"));
    }
}

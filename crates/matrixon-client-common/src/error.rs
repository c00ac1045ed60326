// =============================================================================
// Matrixon Client SDK - Error Types
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-03-21
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Error taxonomy for the Matrixon client-server sync engine. Every failure
//   the sync core can produce is represented here, split along the axis that
//   matters to callers: which errors the HTTP executor retries on its own,
//   which surface to the sync loop's failure handler, and which are fatal.
//
// Features:
//   • Transport / server / rate-limit / client / decode classification
//   • Parsed Matrix error envelopes ({errcode, error}) when available
//   • Request context (method, URL, status) on every HTTP failure
//   • Retryability predicate used by the executor's backoff loop
//
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Method, URL and attempt count of the request that produced an error.
///
/// Carried on every HTTP-level error variant so that log output and bug
/// reports can identify the offending request without extra correlation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method of the failed request
    pub method: String,
    /// Full request URL
    pub url: String,
    /// How many attempts were made before giving up
    pub attempts: u32,
}

impl std::fmt::Display for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (after {} attempt{})",
            self.method,
            self.url,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" }
        )
    }
}

/// Matrixon client error types
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Network-level failure (connection refused, timeout). Retryable.
    #[error("Transport error on {context}: {message}")]
    Transport {
        context: RequestContext,
        message: String,
    },

    /// HTTP 502/503/504 from the homeserver. Retryable.
    #[error("Server error on {context}: HTTP {status} {errcode:?} {message:?}")]
    Server {
        context: RequestContext,
        status: u16,
        /// Parsed `errcode` from the Matrix error envelope, if the body had one
        errcode: Option<String>,
        /// Parsed `error` message from the envelope, if present
        message: Option<String>,
        /// Raw body excerpt when the body was not a recognizable envelope
        body: Option<String>,
    },

    /// HTTP 429. Retryable after the server-specified delay.
    #[error("Rate limited on {context}, retry after {retry_after:?}")]
    RateLimited {
        context: RequestContext,
        retry_after: Option<Duration>,
        /// Matrix error code, conventionally M_LIMIT_EXCEEDED
        errcode: Option<String>,
    },

    /// Any other non-2xx response. Not retried.
    #[error("HTTP {status} on {context}: {errcode:?} {message:?}")]
    Http {
        context: RequestContext,
        status: u16,
        /// Parsed `errcode` from the Matrix error envelope, if the body had one
        errcode: Option<String>,
        /// Parsed `error` message from the envelope, if present
        message: Option<String>,
        /// Raw body excerpt when the body was not a recognizable envelope
        body: Option<String>,
    },

    /// Response body was not valid JSON for the expected type. Not retried.
    #[error("Failed to decode response from {context}: {message}")]
    Decode {
        context: RequestContext,
        message: String,
    },

    /// Filter creation failed during sync startup. Always fatal.
    #[error("Filter creation failed: {0}")]
    FilterCreation(Box<ClientError>),

    /// An event listener panicked while processing a sync batch.
    #[error("Listener panicked while processing sync batch (since={since}): {message}")]
    ListenerPanic { since: String, message: String },

    /// Sync store failure (cursor or filter id persistence).
    #[error("Sync store error: {0}")]
    Store(String),

    /// Invalid configuration (homeserver URL, credentials shape, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for Matrixon client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Whether the HTTP executor may transparently retry this failure.
    ///
    /// Rate-limit responses are retryable too, but carry their own delay and
    /// are handled separately from the exponential backoff path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport { .. }
                | ClientError::Server { .. }
                | ClientError::RateLimited { .. }
        )
    }

    /// The Matrix `errcode` attached to this error, if the server sent one.
    pub fn errcode(&self) -> Option<&str> {
        match self {
            ClientError::Http { errcode, .. }
            | ClientError::Server { errcode, .. }
            | ClientError::RateLimited { errcode, .. } => errcode.as_deref(),
            ClientError::FilterCreation(inner) => inner.errcode(),
            _ => None,
        }
    }

    /// The HTTP status code of this error, if it got as far as a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Server { status, .. } | ClientError::Http { status, .. } => Some(*status),
            ClientError::RateLimited { .. } => Some(429),
            ClientError::FilterCreation(inner) => inner.status(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn ctx() -> RequestContext {
        RequestContext {
            method: "GET".to_string(),
            url: "https://example.org/_matrix/client/r0/sync".to_string(),
            attempts: 3,
        }
    }

    #[test]
    fn test_retryability() {
        let err = ClientError::Transport {
            context: ctx(),
            message: "connection refused".to_string(),
        };
        assert!(err.is_retryable());

        let err = ClientError::Server {
            context: ctx(),
            status: 503,
            errcode: None,
            message: None,
            body: None,
        };
        assert!(err.is_retryable());

        let err = ClientError::RateLimited {
            context: ctx(),
            retry_after: Some(Duration::from_secs(2)),
            errcode: Some("M_LIMIT_EXCEEDED".to_string()),
        };
        assert!(err.is_retryable());

        let err = ClientError::Http {
            context: ctx(),
            status: 403,
            errcode: Some("M_FORBIDDEN".to_string()),
            message: None,
            body: None,
        };
        assert!(!err.is_retryable());

        let err = ClientError::Decode {
            context: ctx(),
            message: "expected value".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_errcode_and_status() {
        let err = ClientError::Http {
            context: ctx(),
            status: 401,
            errcode: Some("M_UNKNOWN_TOKEN".to_string()),
            message: Some("Unrecognised access token".to_string()),
            body: None,
        };
        assert_eq!(err.errcode(), Some("M_UNKNOWN_TOKEN"));
        assert_eq!(err.status(), Some(401));

        let fatal = ClientError::FilterCreation(Box::new(err));
        assert_eq!(fatal.errcode(), Some("M_UNKNOWN_TOKEN"));
        assert_eq!(fatal.status(), Some(401));
    }

    #[test]
    fn test_request_context_display() {
        let err = ClientError::Server {
            context: ctx(),
            status: 502,
            errcode: Some("M_UNAVAILABLE".to_string()),
            message: None,
            body: None,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("HTTP 502"));
        assert!(rendered.contains("after 3 attempts"));
        assert_eq!(err.errcode(), Some("M_UNAVAILABLE"));
    }
}

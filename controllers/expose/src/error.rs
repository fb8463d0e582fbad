//! Controller-specific error types.
//!
//! This module defines error types for the Expose Controller and the
//! transient/terminal classification that decides whether a failed
//! reconcile is requeued with backoff or dropped.

use thiserror::Error;
use kube::Error as KubeError;

/// Errors that can occur in the Expose Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Notified object is missing the metadata needed to form a reconcile key
    #[error("Cannot extract reconcile key: {0}")]
    KeyExtraction(String),

    /// Primary object cannot yield a valid desired state
    #[error("Invalid primary spec: {0}")]
    InvalidSpec(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Classification of a reconcile failure for retry purposes.
///
/// Transient errors are requeued with backoff; terminal errors are
/// logged and dropped rather than retried forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected to succeed on retry (network issues, conflicts, throttling)
    Transient,
    /// Will not recover without a change to the resource (validation,
    /// permissions, malformed spec)
    Terminal,
}

impl ControllerError {
    /// Classifies this error as transient or terminal.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Kube(KubeError::Api(resp)) => match resp.code {
                // Timeouts, conflicts, throttling and server-side failures
                // are expected to clear on retry.
                408 | 409 | 429 | 500 | 502 | 503 | 504 => ErrorKind::Transient,
                _ => ErrorKind::Terminal,
            },
            // Transport-level failures (connection refused, TLS, DNS) have
            // no API status code and are retried.
            ControllerError::Kube(_) => ErrorKind::Transient,
            ControllerError::InvalidConfig(_)
            | ControllerError::KeyExtraction(_)
            | ControllerError::InvalidSpec(_)
            | ControllerError::Watch(_)
            | ControllerError::Metrics(_) => ErrorKind::Terminal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> ControllerError {
        ControllerError::Kube(KubeError::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn test_server_side_failures_are_transient() {
        for code in [408, 409, 429, 500, 502, 503, 504] {
            assert_eq!(
                api_error(code).kind(),
                ErrorKind::Transient,
                "status {code} should be retried"
            );
        }
    }

    #[test]
    fn test_client_side_failures_are_terminal() {
        for code in [400, 401, 403, 404, 422] {
            assert_eq!(
                api_error(code).kind(),
                ErrorKind::Terminal,
                "status {code} should not be retried"
            );
        }
    }

    #[test]
    fn test_invalid_spec_is_terminal() {
        let err = ControllerError::InvalidSpec("no template labels".to_string());
        assert_eq!(err.kind(), ErrorKind::Terminal);
    }
}

//! Error types for request tasks.
//!
//! # Design
//! Only contract violations (`InvalidRequest`, `InvalidConfig`,
//! `AlreadyExecuted`, `NoRuntime`) are returned synchronously. Every other
//! variant reaches the caller through the task's completion handler.
//! `Protocol` and `CredentialExpired` keep the full response so callers
//! still see status and headers on a failed request.

use crate::http::HttpResponse;

/// Errors produced while constructing, executing or completing a task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The request failed construction-time validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be parsed or applied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `execute` was called on a task that already ran.
    #[error("task has already been executed")]
    AlreadyExecuted,

    /// `execute` was called outside a tokio runtime.
    #[error("no async runtime available to execute the task")]
    NoRuntime,

    /// The network exchange itself failed (connect, reset, DNS).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("HTTP {}", response.status)]
    Protocol { response: Box<HttpResponse> },

    /// The credential attached to the request is no longer accepted.
    ///
    /// `generation` identifies the rejected credential so that tasks which
    /// failed with the same one share a single refresh.
    #[error("authentication credential expired")]
    CredentialExpired {
        response: Option<Box<HttpResponse>>,
        generation: Option<u64>,
    },

    /// Obtaining or refreshing a credential failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("task was cancelled")]
    Cancelled,

    /// Reading an upload source or writing a download destination failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// An expiry with no server response attached.
    pub fn credential_expired() -> Self {
        TaskError::CredentialExpired {
            response: None,
            generation: None,
        }
    }

    pub fn is_credential_expired(&self) -> bool {
        matches!(self, TaskError::CredentialExpired { .. })
    }

    /// Response metadata attached to the error, if the server answered.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            TaskError::Protocol { response } => Some(response),
            TaskError::CredentialExpired {
                response: Some(response),
                ..
            } => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_exposes_response() {
        let err = TaskError::Protocol {
            response: Box::new(HttpResponse {
                status: 503,
                headers: Vec::new(),
                body: b"busy".to_vec(),
            }),
        };
        assert_eq!(err.to_string(), "HTTP 503");
        assert_eq!(err.response().map(|r| r.status), Some(503));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn classification_helpers() {
        assert!(TaskError::Cancelled.is_cancelled());
        assert!(TaskError::credential_expired().is_credential_expired());
        assert!(TaskError::credential_expired().response().is_none());
        assert!(TaskError::Timeout.response().is_none());
    }

    #[test]
    fn credential_expiry_exposes_rejected_response() {
        let err = TaskError::CredentialExpired {
            response: Some(Box::new(HttpResponse {
                status: 401,
                headers: vec![("www-authenticate".into(), "Bearer".into())],
                body: Vec::new(),
            })),
            generation: Some(2),
        };
        assert_eq!(err.to_string(), "authentication credential expired");
        let response = err.response().unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(response.header("www-authenticate"), Some("Bearer"));
    }

    #[test]
    fn io_errors_convert() {
        let err: TaskError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, TaskError::Io(_)));
    }
}

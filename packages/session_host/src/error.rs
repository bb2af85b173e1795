//! Error types and client-facing error responses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::session::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("multiple startup entries are configured to use the same endpoint '{endpoint}'")]
    DuplicateEndpoint { endpoint: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(#[source] Box<SessionError>),

    #[error("startup failed to configure services: {0}")]
    Startup(#[source] anyhow::Error),

    #[error("session {session_id} on '{endpoint}' failed to configure: {source}")]
    SessionConfiguration {
        session_id: SessionId,
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("service is not registered: {service}")]
    ServiceNotRegistered { service: &'static str },

    #[error("scope for session {0} has been disposed")]
    ScopeDisposed(SessionId),

    #[error("session {0} has terminated")]
    SessionTerminated(SessionId),

    #[error("dispatch queue for session {0} is full")]
    DispatchQueueFull(SessionId),

    #[error("no handler registered for event '{0}'")]
    UnknownEvent(String),

    #[error("event handler '{name}' failed: {source}")]
    EventHandler {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("interop call '{identifier}' timed out after {timeout:?}")]
    InteropTimeout {
        identifier: String,
        timeout: Duration,
    },

    #[error("client rejected interop call '{identifier}': {message}")]
    InteropRejected { identifier: String, message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("sessions need a running Tokio runtime")]
    RuntimeUnavailable,

    #[error("failed to decode interop result: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::DuplicateEndpoint { .. } => "duplicate_endpoint",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Startup(_) => "startup_failed",
            Self::SessionConfiguration { .. } => "session_configuration",
            Self::ServiceNotRegistered { .. } => "service_not_registered",
            Self::ScopeDisposed(_) => "scope_disposed",
            Self::SessionTerminated(_) => "session_terminated",
            Self::DispatchQueueFull(_) => "dispatch_queue_full",
            Self::UnknownEvent(_) => "unknown_event",
            Self::EventHandler { .. } => "event_handler_failed",
            Self::InteropTimeout { .. } => "interop_timeout",
            Self::InteropRejected { .. } => "interop_rejected",
            Self::ConnectionClosed => "connection_closed",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::Decode(_) => "decode_failed",
        }
    }

    /// Wrap a policy violation for the registration caller.
    pub(crate) fn invalid_operation(inner: SessionError) -> Self {
        Self::InvalidOperation(Box::new(inner))
    }
}

/// Serializable error sent to a client before its connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<&SessionError> for ErrorResponse {
    fn from(err: &SessionError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(
            SessionError::DuplicateEndpoint {
                endpoint: "/app".to_string()
            }
            .error_code(),
            "duplicate_endpoint"
        );
        assert_eq!(
            SessionError::ConnectionClosed.error_code(),
            "connection_closed"
        );
        assert_eq!(
            SessionError::UnknownEvent("click".to_string()).error_code(),
            "unknown_event"
        );
        assert_eq!(
            SessionError::RuntimeUnavailable.error_code(),
            "runtime_unavailable"
        );
    }

    #[test]
    fn invalid_operation_keeps_inner_error() {
        let err = SessionError::invalid_operation(SessionError::DuplicateEndpoint {
            endpoint: "/app".to_string(),
        });
        assert_eq!(err.error_code(), "invalid_operation");
        assert!(err.to_string().contains("'/app'"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().starts_with("multiple startup entries"));
    }

    #[test]
    fn configuration_error_message() {
        let id = SessionId::new();
        let err = SessionError::SessionConfiguration {
            session_id: id,
            endpoint: "/app".to_string(),
            source: anyhow::anyhow!("boom"),
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.ends_with("boom"));
    }

    #[test]
    fn error_response_serde() {
        let err = SessionError::InteropRejected {
            identifier: "app.render".to_string(),
            message: "not found".to_string(),
        };
        let resp = ErrorResponse::from(&err);
        let json = serde_json::to_string(&resp).unwrap();
        let back: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, "interop_rejected");
        assert_eq!(back, resp);
    }
}

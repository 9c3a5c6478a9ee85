//! Client-side error taxonomy.
//!
//! Session-wide failures (transport, authentication) escalate to the
//! room session state machine; per-track failures recover locally and
//! never abort a join sequence.

use room_protocol::ErrorCode;
use thiserror::Error;

/// Client session error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The signaling channel dropped. In-flight requests fail with
    /// this; the state machine decides whether to reconnect.
    #[error("Connection lost")]
    ConnectionLost,

    /// A room-scoped request was issued before the authentication
    /// handshake completed.
    #[error("Not authenticated")]
    Unauthenticated,

    /// A role check failed on a privileged operation. Surfaced, never
    /// retried.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Device/transport/produce/consume negotiation failed.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The admission attempt was rejected by a host. Terminal for this
    /// attempt.
    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    /// A completion referenced a torn-down session generation; the
    /// result was discarded.
    #[error("Stale event for a previous session generation")]
    StaleEvent,

    /// No response within the request deadline.
    #[error("Request timed out")]
    Timeout,

    /// The peer violated the wire protocol (unexpected reply shape).
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The session is not in a state that allows the operation.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Any other structured server error.
    #[error("Server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },
}

impl SessionError {
    /// Map a wire error reply onto the client taxonomy.
    #[must_use]
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::Unauthenticated => SessionError::Unauthenticated,
            ErrorCode::Unauthorized => SessionError::Unauthorized(message),
            ErrorCode::NegotiationFailed => SessionError::NegotiationFailed(message),
            _ => SessionError::Server { code, message },
        }
    }

    /// Whether the failure concerns the whole session (escalates to the
    /// state machine) rather than a single track.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionLost | SessionError::Unauthenticated
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_mapping() {
        assert_eq!(
            SessionError::from_wire(ErrorCode::Unauthenticated, "x".to_string()),
            SessionError::Unauthenticated
        );
        assert_eq!(
            SessionError::from_wire(ErrorCode::Unauthorized, "not host".to_string()),
            SessionError::Unauthorized("not host".to_string())
        );
        assert!(matches!(
            SessionError::from_wire(ErrorCode::Conflict, "dup".to_string()),
            SessionError::Server {
                code: ErrorCode::Conflict,
                ..
            }
        ));
    }

    #[test]
    fn test_fatality_classification() {
        assert!(SessionError::ConnectionLost.is_session_fatal());
        assert!(!SessionError::NegotiationFailed("one track".to_string()).is_session_fatal());
        assert!(!SessionError::Timeout.is_session_fatal());
    }
}

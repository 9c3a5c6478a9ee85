//! Room controller error types.
//!
//! Error types map to wire [`ErrorCode`] values for client replies.
//! Internal details are logged server-side but not exposed to clients.

use room_protocol::ErrorCode;
use thiserror::Error;

use crate::relay::RelayError;

/// Room controller error type.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Room does not exist (or has ended).
    #[error("Room not found")]
    RoomNotFound,

    /// Caller is not a participant of the room.
    #[error("Participant not found")]
    ParticipantNotFound,

    /// Referenced producer does not exist.
    #[error("Producer not found")]
    ProducerNotFound,

    /// Referenced consumer does not exist.
    #[error("Consumer not found")]
    ConsumerNotFound,

    /// Referenced transport does not exist or has the wrong direction.
    #[error("Transport not found")]
    TransportNotFound,

    /// Request requires the authentication handshake first.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Token verification failed.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Role check failed on a privileged operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// State conflict (e.g. already in the room, duplicate producer).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Room or controller is at capacity.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Device/transport/produce/consume negotiation failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Controller or room is shutting down.
    #[error("Shutting down")]
    Draining,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Returns the wire [`ErrorCode`] for this error.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            RoomError::Unauthenticated | RoomError::InvalidToken(_) => ErrorCode::Unauthenticated,
            RoomError::PermissionDenied(_) => ErrorCode::Unauthorized,
            RoomError::RoomNotFound
            | RoomError::ParticipantNotFound
            | RoomError::ProducerNotFound
            | RoomError::ConsumerNotFound
            | RoomError::TransportNotFound => ErrorCode::NotFound,
            RoomError::Conflict(_) => ErrorCode::Conflict,
            RoomError::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
            RoomError::Negotiation(_) => ErrorCode::NegotiationFailed,
            RoomError::Draining => ErrorCode::ShuttingDown,
            RoomError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::Internal(_) => "An internal error occurred".to_string(),
            RoomError::InvalidToken(_) => "Invalid or expired token".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<RelayError> for RoomError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::TransportNotFound => RoomError::TransportNotFound,
            RelayError::ProducerNotFound => RoomError::ProducerNotFound,
            RelayError::ConsumerNotFound => RoomError::ConsumerNotFound,
            RelayError::Rejected(reason) => RoomError::Negotiation(reason),
        }
    }
}

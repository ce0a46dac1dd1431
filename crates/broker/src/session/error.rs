//! Errors raised by the session layer.

use protocol::{ErrorCode, ErrorMessage};
use thiserror::Error;

use super::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The owner already holds the maximum number of sessions.
    #[error("session limit of {max} reached for user {owner}")]
    LimitExceeded {
        /// Owner whose cap was hit.
        owner: String,
        /// The configured per-owner cap.
        max: usize,
    },

    /// The broker-wide session cap was hit.
    #[error("broker capacity of {0} sessions reached")]
    CapacityExhausted(usize),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Failed to spawn the PTY or its process.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// The session's process has already exited.
    #[error("session process has exited: {0}")]
    WriteToDeadSession(SessionId),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to signal the process.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns the wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::LimitExceeded { .. } | SessionError::CapacityExhausted(_) => {
                ErrorCode::SessionLimitExceeded
            }
            SessionError::NotFound(_) => ErrorCode::SessionNotFound,
            SessionError::SpawnFailed(_) => ErrorCode::ProcessSpawnFailed,
            SessionError::WriteToDeadSession(_) => ErrorCode::WriteToDeadSession,
            SessionError::ResizeFailed(_) | SessionError::KillFailed(_) | SessionError::Io(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Returns whether the client can act on the error and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::LimitExceeded { .. }
                | SessionError::CapacityExhausted(_)
                | SessionError::WriteToDeadSession(_)
        )
    }

    /// Converts the error into a wire error message.
    pub fn to_error_message(&self) -> ErrorMessage {
        let context = match self {
            SessionError::NotFound(id) | SessionError::WriteToDeadSession(id) => Some(id.clone()),
            SessionError::LimitExceeded { owner, .. } => Some(owner.clone()),
            _ => None,
        };

        ErrorMessage {
            code: self.code(),
            message: self.to_string(),
            context,
            recoverable: self.is_recoverable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_is_recoverable() {
        let err = SessionError::LimitExceeded {
            owner: "alice".to_string(),
            max: 5,
        };
        let msg = err.to_error_message();

        assert_eq!(msg.code, ErrorCode::SessionLimitExceeded);
        assert!(msg.recoverable);
        assert_eq!(msg.context.as_deref(), Some("alice"));
        assert_eq!(msg.message, "session limit of 5 reached for user alice");
    }

    #[test]
    fn test_capacity_exhausted_shares_limit_code() {
        let err = SessionError::CapacityExhausted(100);
        assert_eq!(err.code(), ErrorCode::SessionLimitExceeded);
    }

    #[test]
    fn test_not_found_carries_session_id() {
        let msg = SessionError::NotFound("abc".to_string()).to_error_message();
        assert_eq!(msg.code, ErrorCode::SessionNotFound);
        assert!(!msg.recoverable);
        assert_eq!(msg.context.as_deref(), Some("abc"));
    }

    #[test]
    fn test_spawn_failure_code() {
        let msg = SessionError::SpawnFailed("No such file".to_string()).to_error_message();
        assert_eq!(msg.code, ErrorCode::ProcessSpawnFailed);
        assert!(!msg.recoverable);
    }

    #[test]
    fn test_io_maps_to_internal() {
        let err: SessionError = std::io::Error::other("boom").into();
        assert_eq!(err.code(), ErrorCode::InternalError);
    }
}

use thiserror::Error;

use crate::session::CallStatus;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media device error: {0}")]
    Device(String),

    #[error("Signal transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Cannot {action} while call is {status}")]
    InvalidState {
        action: &'static str,
        status: CallStatus,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Another call action is already in flight")]
    ActionInFlight,

    /// The connection an async continuation was working on has been torn down.
    #[error("Stale connection: {0}")]
    Stale(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    /// Only transport failures are worth sending again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = CallError::InvalidState {
            action: "answer",
            status: CallStatus::Outgoing,
        };
        assert_eq!(err.to_string(), "Cannot answer while call is outgoing");
    }

    #[test]
    fn test_error_classification() {
        assert!(CallError::Transport("timeout".to_string()).is_retryable());
        assert!(!CallError::Protocol("bad".to_string()).is_retryable());
        assert!(CallError::Stale("gone".to_string()).is_stale());
        assert!(!CallError::ActionInFlight.is_stale());
    }
}

use thiserror::Error;

/// Errors raised by a pub/sub transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection errors
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    /// Channel errors
    #[error("Failed to attach channel {channel}: {reason}")]
    Attach { channel: String, reason: String },

    #[error("Failed to publish to {channel}: {reason}")]
    Publish { channel: String, reason: String },

    #[error("Failed to fetch history for {channel}: {reason}")]
    History { channel: String, reason: String },

    /// Wire errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the REST backend notifier
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Request(err.to_string())
    }
}

/// Errors surfaced by the class membership service
#[derive(Debug, Error)]
pub enum ClassError {
    /// Reconnect attempts exhausted
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to join class: {0}")]
    Join(String),

    #[error("Failed to send: {0}")]
    Send(String),

    #[error("Failed to switch channel: {0}")]
    ChannelSwitch(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Convenience type alias for Results using ClassError
pub type Result<T> = std::result::Result<T, ClassError>;

impl ClassError {
    /// Helper to create InvalidState errors with context
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ClassError::InvalidState(msg.into())
    }

    /// Helper to create Send errors with context
    pub fn send(msg: impl Into<String>) -> Self {
        ClassError::Send(msg.into())
    }
}

impl TransportError {
    pub fn publish(channel: &str, reason: impl Into<String>) -> Self {
        TransportError::Publish {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    pub fn history(channel: &str, reason: impl Into<String>) -> Self {
        TransportError::History {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::publish("class-demo", "NACK 40160");
        assert_eq!(err.to_string(), "Failed to publish to class-demo: NACK 40160");

        let err = NotifyError::Status {
            status: 503,
            message: "Service Unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");
    }

    #[test]
    fn test_error_helpers() {
        let err = ClassError::invalid_state("not joined");
        assert!(matches!(err, ClassError::InvalidState(_)));

        let err: ClassError = TransportError::NotConnected.into();
        assert_eq!(err.to_string(), "Not connected");
    }
}

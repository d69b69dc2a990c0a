use super::codec::CodecError;
use super::protocol::ErrorMessage;

/// Faults raised by an RPC connection
///
/// `ConnectionClosed` is the clean or dirty loss of an established session;
/// every other variant is a transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("remote call `{method}` failed ({}): {}", .error.code, .error.message)]
    Remote { method: String, error: ErrorMessage },

    #[error("`{0}` timed out")]
    Timeout(String),
}

impl TransportError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = TransportError::Remote {
            method: "subscribe".to_owned(),
            error: ErrorMessage::new(ErrorMessage::INVALID_PARAMS, "missing topics"),
        };
        assert_eq!(
            err.to_string(),
            "remote call `subscribe` failed (400): missing topics"
        );
        assert!(!err.is_connection_closed());
        assert!(TransportError::ConnectionClosed("eof".to_owned()).is_connection_closed());
    }
}

use strum_macros::Display;

/// Where the client is in its connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Display, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    /// The retry policy gave up; holds the last fault
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// The background start waits for one of these
    pub(crate) fn is_settled(&self) -> bool {
        matches!(self, Self::Connected | Self::Failed(_))
    }
}

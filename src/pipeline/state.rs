//! Connection state management

/// Streaming connection state machine
///
/// `Closed` and `Failed` are terminal: a new session needs a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `open()` not called yet
    Disconnected,

    /// Transport handshake in progress
    Connecting,

    /// Frames may be sent and events are being received
    Open,

    /// Shutting down (transitioning to Closed)
    Closing,

    /// Closed locally or by the remote end
    Closed,

    /// Transport error while connecting or while open
    Failed,
}

impl ConnectionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, target) {
            // From Disconnected
            (Disconnected, Connecting) => true,

            // From Connecting
            (Connecting, Open) => true,
            (Connecting, Failed) => true,
            (Connecting, Closing) => true, // Can abort the handshake

            // From Open
            (Open, Open) => true, // Inbound message
            (Open, Closing) => true,
            (Open, Failed) => true,

            // From Closing
            (Closing, Closed) => true,

            // Terminal
            (Closed, _) | (Failed, _) => false,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Open",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
            ConnectionState::Failed => "Failed",
        }
    }

    /// Check if frames may be sent
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

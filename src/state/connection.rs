use std::fmt;

/// Connectivity of the push channel as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport and no pending reconnection.
    #[default]
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// A transport is live and delivering frames.
    Connected,
    /// The transport failed; a backoff timer or retry is pending.
    Reconnecting,
}

impl ConnectionState {
    /// Whether inbound frames can currently arrive.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

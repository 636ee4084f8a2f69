use std::fmt;

/// Lifecycle of one socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SocketState {
    /// Not connected; nobody is trying to connect.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    Connected,
    /// Shutdown has begun; no new writes are accepted.
    Disconnecting,
    /// Disconnected, with a reconnect attempt scheduled. Only reachable on
    /// dialled (outbound) connections with reconnection enabled.
    RetryConnect,
}

impl SocketState {
    #[inline]
    pub fn is_connected(self) -> bool {
        self == SocketState::Connected
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketState::Disconnected => "Disconnected",
            SocketState::Connecting => "Connecting",
            SocketState::Connected => "Connected",
            SocketState::Disconnecting => "Disconnecting",
            SocketState::RetryConnect => "RetryConnect",
        };
        f.write_str(s)
    }
}

/// Why a socket left `Connected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Connected, or never disconnected.
    #[default]
    None,
    /// `disconnect()` was called locally.
    Manual,
    CouldNotConnect,
    /// The peer closed or reset the connection.
    ServerDisconnected,
    ServerNotResponding,
    /// An unrecoverable local error, including unframeable inbound bytes.
    Exception,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::None => "None",
            DisconnectReason::Manual => "Manual",
            DisconnectReason::CouldNotConnect => "CouldNotConnect",
            DisconnectReason::ServerDisconnected => "ServerDisconnected",
            DisconnectReason::ServerNotResponding => "ServerNotResponding",
            DisconnectReason::Exception => "Exception",
        };
        f.write_str(s)
    }
}

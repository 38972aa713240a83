use std::fmt;

/// Lifecycle of one connection.
///
/// `Stopped -> Starting -> VersionDetermined -> Ready -> Stopping -> Stopped`.
/// The initiating side additionally passes through `Connecting`, and after a
/// drop through `Disconnected` and `WaitForReconnect`, or settles in
/// `CannotConnect` when reconnecting is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProxyState {
    #[default]
    Stopped,
    Connecting,
    Starting,
    VersionDetermined,
    Ready,
    Stopping,
    Disconnected,
    WaitForReconnect,
    CannotConnect,
}

impl ProxyState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyState::Stopped => "stopped",
            ProxyState::Connecting => "connecting",
            ProxyState::Starting => "starting",
            ProxyState::VersionDetermined => "version_determined",
            ProxyState::Ready => "ready",
            ProxyState::Stopping => "stopping",
            ProxyState::Disconnected => "disconnected",
            ProxyState::WaitForReconnect => "wait_for_reconnect",
            ProxyState::CannotConnect => "cannot_connect",
        }
    }

    /// A socket is attached and the handshake has at least started.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ProxyState::Starting | ProxyState::VersionDetermined | ProxyState::Ready
        )
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

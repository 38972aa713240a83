use std::time::Duration;

use rsmp_protocol::ProtocolError;

use crate::state::ProxyState;

/// Errors raised by a connection or by calls on a [`crate::Proxy`] handle.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("{0}")]
    VersionMismatch(String),
    #[error("no acknowledgement for {message_type} {m_id} within {timeout:?}")]
    MissingAcknowledgment {
        message_type: String,
        m_id: String,
        timeout: Duration,
    },
    #[error("no watchdog received within {0:?}")]
    MissingWatchdog(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("connection not ready (state: {0})")]
    NotReady(ProxyState),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection stopped")]
    Stopped,
    #[error("a connection is already attached")]
    AlreadyConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unknown site '{0}'")]
    UnknownSite(String),
}

impl ProxyError {
    /// Errors that end the connection they occur on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Io(_)
                | ProxyError::Handshake(_)
                | ProxyError::VersionMismatch(_)
                | ProxyError::MissingAcknowledgment { .. }
                | ProxyError::MissingWatchdog(_)
                | ProxyError::UnknownSite(_)
        )
    }
}

/// A problem with one inbound message. Rejected with a MessageNotAck whose
/// `rea` is the display string; the connection carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("unknown component '{0}'")]
    UnknownComponent(String),
    #[error("unknown status {code}/{name} on component '{component}'")]
    UnknownStatus {
        component: String,
        code: String,
        name: String,
    },
    #[error("unknown command {code} on component '{component}'")]
    UnknownCommand { component: String, code: String },
    #[error("unknown alarm {code} on component '{component}'")]
    UnknownAlarm { component: String, code: String },
    #[error("{0} messages are not supported")]
    Unsupported(String),
    #[error("{0}")]
    Invalid(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<ProtocolError> for MessageError {
    fn from(err: ProtocolError) -> Self {
        MessageError::Invalid(err.to_string())
    }
}

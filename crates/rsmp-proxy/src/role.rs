//! The seam between the shared connection machinery and the two RSMP roles.
//!
//! A connection owns its [`RoleHandler`] for its whole lifetime. Handlers are
//! synchronous: they inspect a message and push any replies into an
//! [`Outbox`], which the connection sends after acknowledging the message.

use rsmp_protocol::{Message, ProtocolError};
use tokio::time::Instant;

use crate::error::{MessageError, ProxyError};
use crate::settings::ProxySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the connection and sends the first Version.
    Site,
    /// Accepts connections and answers the site's Version with its own.
    Supervisor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Site => "site",
            Role::Supervisor => "supervisor",
        }
    }
}

/// Messages a handler wants sent, in order.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<Message>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.messages.drain(..)
    }
}

/// Outcome of a failed message handler.
#[derive(Debug)]
pub enum MessageFault {
    /// NotAck the message with this reason and keep going.
    Reject(String),
    /// NotAck (where possible) and stop the connection.
    Fatal(ProxyError),
}

impl From<MessageError> for MessageFault {
    fn from(err: MessageError) -> Self {
        MessageFault::Reject(err.to_string())
    }
}

impl From<ProtocolError> for MessageFault {
    fn from(err: ProtocolError) -> Self {
        MessageFault::Reject(err.to_string())
    }
}

impl From<ProxyError> for MessageFault {
    fn from(err: ProxyError) -> Self {
        if err.is_fatal() {
            MessageFault::Fatal(err)
        } else {
            MessageFault::Reject(err.to_string())
        }
    }
}

pub trait RoleHandler: Send + 'static {
    fn role(&self) -> Role;

    /// The Version message this side sends. `resolved` is set when answering
    /// a peer's Version with the negotiated core version.
    fn version_message(&self, settings: &ProxySettings, resolved: Option<&str>) -> Message;

    /// Role-specific checks of the peer's Version (after core version
    /// negotiation succeeded). An error here is fatal.
    fn accept_version(&mut self, message: &Message, settings: &ProxySettings) -> Result<(), ProxyError> {
        let _ = (message, settings);
        Ok(())
    }

    /// Handle one accepted, non-protocol message.
    fn handle_message(&mut self, message: &Message, outbox: &mut Outbox) -> Result<(), MessageFault>;

    /// Called once per connection when the handshake completes.
    fn on_ready(&mut self, outbox: &mut Outbox) {
        let _ = outbox;
    }

    /// Called on every timer tick while ready.
    fn on_tick(&mut self, now: Instant, outbox: &mut Outbox) {
        let _ = (now, outbox);
    }
}

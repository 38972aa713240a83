//! Waiting for messages on a connection.
//!
//! A [`Collector`] attaches to a proxy's message stream when it is created,
//! so a request sent right after creating it cannot race its response. It
//! detaches when it finishes or is dropped.
//!
//! ```ignore
//! let collector = Collector::new(&proxy, CollectOptions::new().types(["Watchdog"]).num(2));
//! let result = collector.collect().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use rsmp_protocol::{Direction, Message, MessageType};
use tokio::time::Instant;

use crate::listener::{CancelHandle, Listener, Notice};
use crate::proxy::Proxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionFilter {
    #[default]
    Ingoing,
    Outgoing,
    Both,
}

/// Which messages count, how many, and for how long to wait.
#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub direction: DirectionFilter,
    /// Type names (`"Alarm"`, `"StatusUpdate"`, ...). Empty means any type.
    pub types: Vec<String>,
    pub component: Option<String>,
    pub num: usize,
    pub timeout: Duration,
    /// Id of the request this collection answers. A MessageNotAck for it
    /// cancels the collection.
    pub m_id: Option<String>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        CollectOptions {
            direction: DirectionFilter::Ingoing,
            types: Vec::new(),
            component: None,
            num: 1,
            timeout: Duration::from_secs(5),
            m_id: None,
        }
    }
}

impl CollectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn direction(mut self, direction: DirectionFilter) -> Self {
        self.direction = direction;
        self
    }

    pub fn num(mut self, num: usize) -> Self {
        self.num = num;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn m_id(mut self, m_id: impl Into<String>) -> Self {
        self.m_id = Some(m_id.into());
        self
    }

    /// Direction, type and component filters.
    pub(crate) fn accepts(&self, message: &Message) -> bool {
        let direction_ok = match (self.direction, message.direction()) {
            (DirectionFilter::Both, _) => true,
            (DirectionFilter::Ingoing, Some(Direction::In)) => true,
            (DirectionFilter::Outgoing, Some(Direction::Out)) => true,
            _ => false,
        };
        direction_ok
            && (self.types.is_empty() || self.types.iter().any(|t| t == message.type_name()))
            && self
                .component
                .as_deref()
                .is_none_or(|component| message.component_id() == Some(component))
    }

    /// A NotAck from the peer referring to the request being answered.
    pub(crate) fn rejection<'a>(&self, message: &'a Message) -> Option<&'a str> {
        let m_id = self.m_id.as_deref()?;
        let is_rejection = message.message_type() == MessageType::MessageNotAck
            && message.direction() == Some(Direction::In)
            && message.original_m_id() == Some(m_id);
        is_rejection.then(|| message.reason().unwrap_or_default())
    }
}

/// What a predicate thinks of a message that passed the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    /// Drop what was kept so far; the match has to start over.
    Reject,
    Indifferent,
    /// Stop collecting now.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectStatus {
    Ready,
    Collecting,
    Ok,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectError {
    #[error("request rejected: {0}")]
    MessageRejected(String),
    #[error("connection stopped while collecting")]
    Disconnected,
    #[error("collection cancelled")]
    Cancelled,
    #[error("timeout while collecting")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct CollectResult {
    pub messages: Vec<Arc<Message>>,
    pub status: CollectStatus,
    pub error: Option<CollectError>,
}

impl CollectResult {
    pub fn is_ok(&self) -> bool {
        self.status == CollectStatus::Ok
    }

    pub fn into_messages(self) -> Result<Vec<Arc<Message>>, CollectError> {
        match self.status {
            CollectStatus::Ok => Ok(self.messages),
            CollectStatus::Timeout => Err(CollectError::Timeout),
            _ => Err(self.error.unwrap_or(CollectError::Cancelled)),
        }
    }
}

type Predicate = Box<dyn FnMut(&Message) -> Verdict + Send>;

pub struct Collector {
    listener: Listener,
    options: CollectOptions,
    predicate: Option<Predicate>,
    messages: Vec<Arc<Message>>,
    status: CollectStatus,
    error: Option<CollectError>,
}

impl Collector {
    pub fn new(proxy: &Proxy, options: CollectOptions) -> Self {
        Collector {
            listener: Listener::attach(proxy),
            options,
            predicate: None,
            messages: Vec::new(),
            status: CollectStatus::Ready,
            error: None,
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl FnMut(&Message) -> Verdict + Send + 'static,
    ) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.listener.cancel_handle()
    }

    pub fn status(&self) -> CollectStatus {
        self.status
    }

    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    /// Feed one message. Returns `true` once collection is finished.
    pub fn process(&mut self, message: &Arc<Message>) -> bool {
        if let Some(reason) = self.options.rejection(message) {
            self.finish(CollectStatus::Cancelled, Some(CollectError::MessageRejected(reason.to_owned())));
            return true;
        }
        if !self.options.accepts(message) {
            return false;
        }
        let verdict = match self.predicate.as_mut() {
            Some(predicate) => predicate(message),
            None => Verdict::Keep,
        };
        match verdict {
            Verdict::Keep => {
                self.messages.push(message.clone());
                if self.messages.len() >= self.options.num {
                    self.finish(CollectStatus::Ok, None);
                    return true;
                }
            }
            Verdict::Reject => self.messages.clear(),
            Verdict::Indifferent => {}
            Verdict::Cancel => {
                self.finish(CollectStatus::Cancelled, Some(CollectError::Cancelled));
                return true;
            }
        }
        false
    }

    fn finish(&mut self, status: CollectStatus, error: Option<CollectError>) {
        self.status = status;
        self.error = error;
    }

    /// Wait until done, timed out, cancelled or the connection stops.
    pub async fn collect(mut self) -> CollectResult {
        self.status = CollectStatus::Collecting;
        let deadline = Instant::now() + self.options.timeout;
        loop {
            match self.listener.next(deadline).await {
                Notice::Message(message) => {
                    if self.process(&message) {
                        break;
                    }
                }
                Notice::Timeout => {
                    self.finish(CollectStatus::Timeout, None);
                    break;
                }
                Notice::Stopped => {
                    self.finish(CollectStatus::Cancelled, Some(CollectError::Disconnected));
                    break;
                }
                Notice::Cancelled => {
                    self.finish(CollectStatus::Cancelled, Some(CollectError::Cancelled));
                    break;
                }
            }
        }
        CollectResult {
            messages: self.messages,
            status: self.status,
            error: self.error,
        }
    }
}

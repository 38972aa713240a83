//! The caller-facing handle of one RSMP connection.
//!
//! A [`Proxy`] outlives individual TCP connections: a site keeps one per
//! supervisor across reconnects, a supervisor keeps one per site id. While a
//! socket is attached, [`Proxy::run`] drives it; everything else on the handle
//! talks to that task through a command channel or observes it through
//! `watch`/`broadcast` channels.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use rsmp_log::Archive;
use rsmp_protocol::{CoreShapeValidator, Message, MessageType, RecordCodec, SchemaValidator};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::codec::FramedRead;
use tracing::{Level, info, warn};

use crate::collector::{CollectOptions, CollectResult, Collector};
use crate::connection::Connection;
use crate::error::ProxyError;
use crate::role::RoleHandler;
use crate::settings::ProxySettings;
use crate::state::ProxyState;

const LISTENER_CAPACITY: usize = 1024;

pub(crate) enum Command {
    Send {
        message: Message,
        reply: oneshot::Sender<Result<SendOutcome, ProxyError>>,
    },
    Stop,
}

/// What happened to a message handed to [`Proxy::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the socket; `m_id` is `None` only for acknowledgements.
    Sent { m_id: Option<String> },
    /// Not connected; kept for sending after the next handshake.
    Buffered,
}

/// Facts learned from the peer during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub core_version: Option<String>,
    pub sxl_version: Option<String>,
    pub peer_site_ids: Vec<String>,
}

pub(crate) struct Shared {
    settings: ProxySettings,
    state: watch::Sender<ProxyState>,
    messages: broadcast::Sender<Arc<Message>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    buffer: Mutex<VecDeque<Message>>,
    info: Mutex<ConnectionInfo>,
    archive: Option<Arc<Archive>>,
    validator: Arc<dyn SchemaValidator>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct Proxy {
    shared: Arc<Shared>,
}

impl Proxy {
    pub fn new(settings: ProxySettings) -> Self {
        Self::with_parts(settings, None, Arc::new(CoreShapeValidator))
    }

    pub fn with_parts(
        settings: ProxySettings,
        archive: Option<Arc<Archive>>,
        validator: Arc<dyn SchemaValidator>,
    ) -> Self {
        let (state, _) = watch::channel(ProxyState::Stopped);
        let (messages, _) = broadcast::channel(LISTENER_CAPACITY);
        Proxy {
            shared: Arc::new(Shared {
                settings,
                state,
                messages,
                commands: Mutex::new(None),
                buffer: Mutex::new(VecDeque::new()),
                info: Mutex::new(ConnectionInfo::default()),
                archive,
                validator,
            }),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.shared.settings
    }

    pub fn site_id(&self) -> &str {
        &self.shared.settings.site_id
    }

    pub(crate) fn validator(&self) -> &dyn SchemaValidator {
        self.shared.validator.as_ref()
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ProxyState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProxyState> {
        self.shared.state.subscribe()
    }

    /// Move to `state`, notifying watchers only on an actual change.
    pub fn set_state(&self, state: ProxyState) {
        let mut previous = state;
        let changed = self.shared.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                previous = std::mem::replace(current, state);
                true
            }
        });
        if changed {
            info!(site_id = %self.site_id(), from = %previous, to = %state, "state changed");
        }
    }

    /// Wait until the connection reaches `target`.
    ///
    /// Fails with [`ProxyError::Stopped`] if the connection stops first (unless
    /// `Stopped` is the target), and with [`ProxyError::Timeout`] after `timeout`.
    pub async fn wait_for_state(
        &self,
        target: ProxyState,
        timeout: Duration,
    ) -> Result<(), ProxyError> {
        let mut rx = self.watch_state();
        let wait = async {
            let mut transitioned = false;
            loop {
                let current = *rx.borrow_and_update();
                if current == target {
                    return Ok(());
                }
                if transitioned && current == ProxyState::Stopped {
                    return Err(ProxyError::Stopped);
                }
                if rx.changed().await.is_err() {
                    return Err(ProxyError::Stopped);
                }
                transitioned = true;
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or_else(|_| {
            Err(ProxyError::Timeout(format!(
                "state {} not reached within {:?}",
                target, timeout
            )))
        })
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        lock(&self.shared.info).clone()
    }

    pub fn core_version(&self) -> Option<String> {
        lock(&self.shared.info).core_version.clone()
    }

    pub(crate) fn update_info(&self, update: impl FnOnce(&mut ConnectionInfo)) {
        update(&mut lock(&self.shared.info));
    }

    /// A connection task currently owns a socket for this proxy.
    pub fn is_attached(&self) -> bool {
        lock(&self.shared.commands).is_some()
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Raw feed of every message sent or received, after processing order.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.shared.messages.subscribe()
    }

    /// Number of attached listeners (collectors, matchers, raw subscribers).
    pub fn listener_count(&self) -> usize {
        self.shared.messages.receiver_count()
    }

    pub(crate) fn publish(&self, message: Message) {
        // No receivers is the normal case.
        let _ = self.shared.messages.send(Arc::new(message));
    }

    pub(crate) fn record(&self, message: &Message) {
        if let Some(archive) = &self.shared.archive {
            archive.record_message(Some(self.site_id()), message);
        }
    }

    pub(crate) fn note(&self, level: Level, text: impl Into<String>) {
        if let Some(archive) = &self.shared.archive {
            archive.log(level, Some(self.site_id()), text);
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a message on the current connection.
    ///
    /// While the connection is not ready, StatusUpdates are buffered with
    /// their quality downgraded and every other message fails.
    pub async fn send(&self, message: Message) -> Result<SendOutcome, ProxyError> {
        let state = self.state();
        let sender = if state == ProxyState::Ready {
            self.command_sender()
        } else {
            None
        };
        let Some(sender) = sender else {
            return self.undeliverable(message, state);
        };
        let (reply, response) = oneshot::channel();
        if let Err(mpsc::error::SendError(command)) = sender.send(Command::Send { message, reply }) {
            return match command {
                Command::Send { message, .. } => self.undeliverable(message, self.state()),
                Command::Stop => Err(ProxyError::NotConnected),
            };
        }
        response.await.unwrap_or(Err(ProxyError::NotConnected))
    }

    /// Attach a collector, send `message`, then wait for the collector.
    ///
    /// The collector is keyed on the message id, so a MessageNotAck for the
    /// request cancels it.
    pub async fn send_and_collect(
        &self,
        message: Message,
        mut options: CollectOptions,
    ) -> Result<CollectResult, ProxyError> {
        if options.m_id.is_none() {
            options.m_id = message.m_id().map(str::to_owned);
        }
        let collector = Collector::new(self, options);
        match self.send(message).await? {
            SendOutcome::Sent { .. } => Ok(collector.collect().await),
            SendOutcome::Buffered => Err(ProxyError::NotConnected),
        }
    }

    pub(crate) fn undeliverable(
        &self,
        message: Message,
        state: ProxyState,
    ) -> Result<SendOutcome, ProxyError> {
        if message.message_type() == MessageType::StatusUpdate {
            self.buffer(&message);
            return Ok(SendOutcome::Buffered);
        }
        if state.is_connected() {
            Err(ProxyError::NotReady(state))
        } else {
            Err(ProxyError::NotConnected)
        }
    }

    fn buffer(&self, message: &Message) {
        let capacity = self.shared.settings.buffer_capacity;
        if capacity == 0 {
            warn!(site_id = %self.site_id(), "buffering disabled, dropping {}", message.type_name());
            return;
        }
        let mut buffer = lock(&self.shared.buffer);
        while buffer.len() >= capacity {
            if let Some(dropped) = buffer.pop_front() {
                warn!(
                    site_id = %self.site_id(),
                    m_id = %dropped.m_id_short(),
                    "buffer full, dropping oldest {}",
                    dropped.type_name()
                );
            }
        }
        buffer.push_back(message.with_downgraded_quality());
    }

    /// Messages waiting for the next handshake, oldest first.
    pub fn buffered(&self) -> Vec<Message> {
        lock(&self.shared.buffer).iter().cloned().collect()
    }

    pub(crate) fn pop_buffered(&self) -> Option<Message> {
        lock(&self.shared.buffer).pop_front()
    }

    pub(crate) fn requeue_buffered(&self, message: Message) {
        lock(&self.shared.buffer).push_front(message);
    }

    fn command_sender(&self) -> Option<mpsc::UnboundedSender<Command>> {
        lock(&self.shared.commands).clone()
    }

    /// Ask the connection task to close the socket. No-op when detached.
    pub fn stop(&self) {
        if let Some(sender) = self.command_sender() {
            let _ = sender.send(Command::Stop);
        }
    }

    // -----------------------------------------------------------------------
    // Running a connection
    // -----------------------------------------------------------------------

    /// Drive one connection until it closes.
    ///
    /// `first` is a record already read from `reader` (the supervisor peeks
    /// at it to find the site id). Returns `Ok` when the peer closes the
    /// socket or [`Proxy::stop`] is called, and the fatal error otherwise.
    pub async fn run<H, R, W>(
        &self,
        handler: H,
        reader: FramedRead<R, RecordCodec>,
        writer: W,
        first: Option<BytesMut>,
    ) -> Result<(), ProxyError>
    where
        H: RoleHandler,
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let commands = self.attach()?;
        Connection::new(self.clone(), handler, writer)
            .run(reader, commands, first)
            .await
    }

    /// [`Proxy::run`] on a freshly connected TCP stream.
    pub async fn run_stream<H: RoleHandler>(
        &self,
        handler: H,
        stream: TcpStream,
    ) -> Result<(), ProxyError> {
        let (read, write) = stream.into_split();
        self.run(handler, FramedRead::new(read, RecordCodec::new()), write, None)
            .await
    }

    fn attach(&self) -> Result<mpsc::UnboundedReceiver<Command>, ProxyError> {
        let receiver = {
            let mut slot = lock(&self.shared.commands);
            if slot.is_some() {
                return Err(ProxyError::AlreadyConnected);
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            *slot = Some(sender);
            receiver
        };
        *lock(&self.shared.info) = ConnectionInfo::default();
        self.set_state(ProxyState::Starting);
        Ok(receiver)
    }

    /// Release the connection slot and answer any commands still queued.
    pub(crate) fn detach(&self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.set_state(ProxyState::Stopping);
        lock(&self.shared.commands).take();
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Send { message, reply } = command {
                let _ = reply.send(self.undeliverable(message, ProxyState::Stopping));
            }
        }
        self.set_state(ProxyState::Stopped);
    }
}

// The task that owns one attached socket.
//
// All per-connection bookkeeping (pending acknowledgements, watchdog times,
// handshake progress) lives in `Connection` and is touched only from
// `Connection::pump`, which processes records, commands and timer ticks one
// at a time in arrival order.

use std::collections::{HashMap, HashSet};

use bytes::BytesMut;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rsmp_protocol::{Direction, Message, MessageType, RecordCodec, SchemaSet, negotiate};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Level, debug, error, info, warn};

use crate::error::ProxyError;
use crate::proxy::{Command, Proxy, SendOutcome};
use crate::role::{MessageFault, Outbox, Role, RoleHandler};
use crate::state::ProxyState;

struct Pending {
    message_type: String,
    sent_at: Instant,
}

pub(crate) struct Connection<H, W> {
    proxy: Proxy,
    handler: H,
    sink: FramedWrite<W, RecordCodec>,
    awaiting_ack: HashMap<String, Pending>,
    ingoing_acked_once: HashSet<String>,
    outgoing_acked_once: HashSet<String>,
    version_received: bool,
    version_acked: bool,
    ready_at: Option<Instant>,
    last_watchdog_received: Option<Instant>,
    last_watchdog_sent: Option<Instant>,
}

impl<H, W> Connection<H, W>
where
    H: RoleHandler,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(proxy: Proxy, handler: H, writer: W) -> Self {
        Connection {
            proxy,
            handler,
            sink: FramedWrite::new(writer, RecordCodec::new()),
            awaiting_ack: HashMap::new(),
            ingoing_acked_once: HashSet::new(),
            outgoing_acked_once: HashSet::new(),
            version_received: false,
            version_acked: false,
            ready_at: None,
            last_watchdog_received: None,
            last_watchdog_sent: None,
        }
    }

    pub(crate) async fn run<R>(
        mut self,
        mut reader: FramedRead<R, RecordCodec>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        first: Option<BytesMut>,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send,
    {
        info!(
            site_id = %self.proxy.site_id(),
            role = self.handler.role().as_str(),
            "connection started"
        );
        let result = self.pump(&mut reader, &mut commands, first).await;
        match &result {
            Ok(()) => info!(site_id = %self.proxy.site_id(), "connection closed"),
            Err(err) => {
                error!(site_id = %self.proxy.site_id(), error = %err, "connection failed");
                self.proxy.note(Level::ERROR, err.to_string());
            }
        }
        if let Err(err) = SinkExt::<String>::close(&mut self.sink).await {
            debug!(site_id = %self.proxy.site_id(), error = %err, "closing socket failed");
        }
        self.proxy.detach(commands);
        result
    }

    async fn pump<R>(
        &mut self,
        reader: &mut FramedRead<R, RecordCodec>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        first: Option<BytesMut>,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.handler.role() == Role::Site {
            let version = self.handler.version_message(self.proxy.settings(), None);
            self.send_message(version).await?;
        }
        if let Some(record) = first {
            self.process_record(&record).await?;
        }

        let timer = self.proxy.settings().intervals.timer;
        let mut ticker = tokio::time::interval(timer);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { message, reply }) => {
                        let (outcome, fatal) = self.send_requested(message).await;
                        let _ = reply.send(outcome);
                        if let Some(err) = fatal {
                            return Err(err);
                        }
                    }
                    Some(Command::Stop) | None => {
                        debug!(site_id = %self.proxy.site_id(), "stop requested");
                        return Ok(());
                    }
                },
                record = reader.next() => match record {
                    Some(Ok(record)) => self.process_record(&record).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        info!(site_id = %self.proxy.site_id(), "peer closed the connection");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => self.on_tick(Instant::now()).await?,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    async fn send_message(&mut self, mut message: Message) -> Result<Option<String>, ProxyError> {
        message.set_direction(Direction::Out);
        self.sink.send(message.to_json()).await?;
        let m_id = message.m_id().map(str::to_owned);
        if let (false, Some(id)) = (message.message_type().is_acknowledgement(), &m_id) {
            self.awaiting_ack.insert(
                id.clone(),
                Pending {
                    message_type: message.type_name().to_owned(),
                    sent_at: Instant::now(),
                },
            );
        }
        debug!(
            site_id = %self.proxy.site_id(),
            msg_type = message.type_name(),
            m_id = message.m_id_short(),
            "sent"
        );
        self.proxy.record(&message);
        self.proxy.publish(message);
        Ok(m_id)
    }

    /// Send on behalf of [`Proxy::send`]. The second value is set when the
    /// write failed and the connection has to end.
    async fn send_requested(
        &mut self,
        message: Message,
    ) -> (Result<SendOutcome, ProxyError>, Option<ProxyError>) {
        let state = self.proxy.state();
        if state != ProxyState::Ready {
            return (self.proxy.undeliverable(message, state), None);
        }
        let retained =
            (message.message_type() == MessageType::StatusUpdate).then(|| message.clone());
        match self.send_message(message).await {
            Ok(m_id) => (Ok(SendOutcome::Sent { m_id }), None),
            Err(err) => {
                let outcome = match retained {
                    Some(update) => self.proxy.undeliverable(update, ProxyState::Stopping),
                    None => Err(ProxyError::NotConnected),
                };
                (outcome, Some(err))
            }
        }
    }

    async fn send_outbox(&mut self, mut outbox: Outbox) -> Result<(), ProxyError> {
        for message in outbox.drain() {
            self.send_message(message).await?;
        }
        Ok(())
    }

    async fn send_watchdog(&mut self, now: Instant) -> Result<(), ProxyError> {
        self.last_watchdog_sent = Some(now);
        self.send_message(Message::watchdog(Utc::now())).await?;
        Ok(())
    }

    async fn flush_buffer(&mut self) -> Result<(), ProxyError> {
        let mut flushed = 0usize;
        while let Some(message) = self.proxy.pop_buffered() {
            if let Err(err) = self.send_message(message.clone()).await {
                self.proxy.requeue_buffered(message);
                return Err(err);
            }
            flushed += 1;
        }
        if flushed > 0 {
            info!(site_id = %self.proxy.site_id(), count = flushed, "flushed buffered messages");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn process_record(&mut self, record: &[u8]) -> Result<(), ProxyError> {
        let built = Message::parse_attributes(record).and_then(|value| Message::build(value, record));
        let message = match built {
            Ok(message) => message,
            Err(err) => {
                warn!(site_id = %self.proxy.site_id(), error = %err, "discarding record");
                self.proxy.note(Level::WARN, format!("discarding record: {}", err));
                return Ok(());
            }
        };
        debug!(
            site_id = %self.proxy.site_id(),
            msg_type = message.type_name(),
            m_id = message.m_id_short(),
            "received"
        );
        self.proxy.record(&message);

        match self.process_message(&message).await {
            Ok(()) => Ok(()),
            Err(MessageFault::Reject(reason)) => {
                warn!(
                    site_id = %self.proxy.site_id(),
                    msg_type = message.type_name(),
                    m_id = message.m_id_short(),
                    reason = %reason,
                    "rejected message"
                );
                self.proxy.note(
                    Level::WARN,
                    format!("rejected {} {}: {}", message.type_name(), message.m_id_short(), reason),
                );
                self.reject(&message, &reason).await
            }
            Err(MessageFault::Fatal(err)) => {
                if !matches!(err, ProxyError::Io(_)) {
                    if let Err(send_err) = self.reject(&message, &err.to_string()).await {
                        debug!(
                            site_id = %self.proxy.site_id(),
                            error = %send_err,
                            "could not send rejection before closing"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn reject(&mut self, message: &Message, reason: &str) -> Result<(), ProxyError> {
        if message.message_type().is_acknowledgement() {
            return Ok(());
        }
        // Without an mId there is nothing to refer the NotAck to.
        if let Ok(not_ack) = Message::not_ack_for(message, reason) {
            self.send_message(not_ack).await?;
        }
        Ok(())
    }

    async fn process_message(&mut self, message: &Message) -> Result<(), MessageFault> {
        let message_type = message.message_type();
        let handshake_message = matches!(
            message_type,
            MessageType::Version | MessageType::MessageAck | MessageType::MessageNotAck
        );
        if !self.version_received && !handshake_message {
            return Err(MessageFault::Fatal(ProxyError::Handshake(
                "Version must be received first".to_owned(),
            )));
        }

        message.validate(self.proxy.validator(), &self.schemas())?;

        self.proxy.publish(message.clone());

        match message_type {
            MessageType::Version => self.process_version(message).await,
            MessageType::MessageAck => self.process_ack(message).await,
            MessageType::MessageNotAck => self.process_not_ack(message),
            MessageType::Watchdog => {
                self.last_watchdog_received = Some(Instant::now());
                self.acknowledge(message).await
            }
            _ => {
                let mut outbox = Outbox::new();
                self.handler.handle_message(message, &mut outbox)?;
                self.acknowledge(message).await?;
                self.send_outbox(outbox).await?;
                Ok(())
            }
        }
    }

    async fn acknowledge(&mut self, message: &Message) -> Result<(), MessageFault> {
        self.send_message(Message::ack_for(message)?).await?;
        if self.ingoing_acked_once.insert(message.type_name().to_owned())
            && message.message_type() == MessageType::Watchdog
        {
            info!(site_id = %self.proxy.site_id(), "first watchdog received");
        }
        Ok(())
    }

    async fn process_version(&mut self, message: &Message) -> Result<(), MessageFault> {
        if self.version_received {
            return Err(MessageFault::Fatal(ProxyError::Handshake(
                "extraneous Version message".to_owned(),
            )));
        }
        let requested = message.core_versions()?;
        let resolved = negotiate(&requested, &self.proxy.settings().core_versions)
            .map_err(|err| MessageFault::Fatal(ProxyError::VersionMismatch(err.to_string())))?;
        self.handler
            .accept_version(message, self.proxy.settings())
            .map_err(MessageFault::Fatal)?;

        self.proxy.update_info(|info| {
            info.core_version = Some(resolved.clone());
            info.sxl_version = message.sxl_version().map(str::to_owned);
            info.peer_site_ids = message.site_ids().unwrap_or_default();
        });
        self.version_received = true;
        self.proxy.set_state(ProxyState::VersionDetermined);
        info!(site_id = %self.proxy.site_id(), core_version = %resolved, "version determined");

        self.acknowledge(message).await?;
        if self.handler.role() == Role::Supervisor {
            let version = self
                .handler
                .version_message(self.proxy.settings(), Some(&resolved));
            self.send_message(version).await?;
        }
        self.check_ready().await?;
        Ok(())
    }

    async fn process_ack(&mut self, message: &Message) -> Result<(), MessageFault> {
        let original = message.original_m_id().unwrap_or_default();
        let Some(pending) = self.awaiting_ack.remove(original) else {
            warn!(site_id = %self.proxy.site_id(), o_m_id = %original, "acknowledgement for unknown message");
            return Ok(());
        };
        debug!(
            site_id = %self.proxy.site_id(),
            msg_type = %pending.message_type,
            "acknowledged"
        );
        if self.outgoing_acked_once.insert(pending.message_type.clone())
            && pending.message_type == MessageType::Version.as_str()
        {
            self.version_acked = true;
            self.check_ready().await?;
        }
        Ok(())
    }

    fn process_not_ack(&mut self, message: &Message) -> Result<(), MessageFault> {
        let original = message.original_m_id().unwrap_or_default();
        let reason = message.reason().unwrap_or_default();
        match self.awaiting_ack.remove(original) {
            Some(pending) if pending.message_type == MessageType::Version.as_str() => Err(
                MessageFault::Fatal(ProxyError::Handshake(format!("Version rejected: {}", reason))),
            ),
            Some(pending) => {
                warn!(
                    site_id = %self.proxy.site_id(),
                    msg_type = %pending.message_type,
                    reason = %reason,
                    "message rejected by peer"
                );
                Ok(())
            }
            None => {
                warn!(site_id = %self.proxy.site_id(), o_m_id = %original, "rejection for unknown message");
                Ok(())
            }
        }
    }

    /// Enter `Ready` once both Versions are through, exactly once.
    async fn check_ready(&mut self) -> Result<(), ProxyError> {
        if !self.version_received || !self.version_acked || self.ready_at.is_some() {
            return Ok(());
        }
        let now = Instant::now();
        self.ready_at = Some(now);
        self.proxy.set_state(ProxyState::Ready);
        self.flush_buffer().await?;
        let mut outbox = Outbox::new();
        self.handler.on_ready(&mut outbox);
        self.send_outbox(outbox).await?;
        self.send_watchdog(now).await
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    async fn on_tick(&mut self, now: Instant) -> Result<(), ProxyError> {
        let settings = self.proxy.settings();
        let ack_timeout = settings.timeouts.acknowledgement;
        let watchdog_timeout = settings.timeouts.watchdog;
        let watchdog_interval = settings.intervals.watchdog;
        let half_tick = settings.intervals.timer / 2;

        if let Some((m_id, pending)) = self
            .awaiting_ack
            .iter()
            .find(|(_, p)| now.saturating_duration_since(p.sent_at) > ack_timeout)
        {
            return Err(ProxyError::MissingAcknowledgment {
                message_type: pending.message_type.clone(),
                m_id: m_id.clone(),
                timeout: ack_timeout,
            });
        }

        let Some(ready_at) = self.ready_at else {
            return Ok(());
        };

        let due = self.last_watchdog_sent.is_none_or(|sent| {
            now.saturating_duration_since(sent) + half_tick >= watchdog_interval
        });
        if due {
            self.send_watchdog(now).await?;
        }

        let since = self.last_watchdog_received.unwrap_or(ready_at);
        if now.saturating_duration_since(since) > watchdog_timeout {
            return Err(ProxyError::MissingWatchdog(watchdog_timeout));
        }

        let mut outbox = Outbox::new();
        self.handler.on_tick(now, &mut outbox);
        self.send_outbox(outbox).await
    }

    fn schemas(&self) -> SchemaSet {
        let settings = self.proxy.settings();
        let info = self.proxy.connection_info();
        let core = info
            .core_version
            .or_else(|| settings.core_versions.last().cloned())
            .unwrap_or_default();
        let sxl_version = info
            .sxl_version
            .unwrap_or_else(|| settings.sxl.version.clone());
        SchemaSet::core(core).with_sxl(settings.sxl.name.clone(), sxl_version)
    }
}

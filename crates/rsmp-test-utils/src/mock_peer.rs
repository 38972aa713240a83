// mock_peer: a scriptable RSMP endpoint over real TCP.
//
// Speaks raw form-feed framed records so tests can drive a proxy from the
// other side, including sending garbage or skipping acknowledgements.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rsmp_protocol::{Message, MessageType, RecordCodec};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockPeer {
    read: FramedRead<OwnedReadHalf, RecordCodec>,
    write: FramedWrite<OwnedWriteHalf, RecordCodec>,
    auto_ack: bool,
    recv_timeout: Duration,
    // Received but skipped over by `recv_matching`; `recv` drains it first.
    backlog: VecDeque<Message>,
}

impl MockPeer {
    /// Connect to a listening RSMP endpoint (normally a supervisor).
    pub async fn connect(addr: SocketAddr) -> Result<Self, BoxError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        MockPeer {
            read: FramedRead::new(read, RecordCodec::new()),
            write: FramedWrite::new(write, RecordCodec::new()),
            auto_ack: false,
            recv_timeout: RECV_TIMEOUT,
            backlog: VecDeque::new(),
        }
    }

    /// Acknowledge every received non-ack message as it is read.
    pub fn set_auto_ack(&mut self, enabled: bool) {
        self.auto_ack = enabled;
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) {
        self.recv_timeout = timeout;
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), BoxError> {
        self.write.send(message.to_json()).await?;
        Ok(())
    }

    /// Send bytes as one record, without any validation.
    pub async fn send_raw(&mut self, record: &[u8]) -> Result<(), BoxError> {
        self.write.send(record).await?;
        Ok(())
    }

    pub async fn ack(&mut self, message: &Message) -> Result<(), BoxError> {
        self.send(&Message::ack_for(message)?).await
    }

    pub async fn not_ack(&mut self, message: &Message, reason: &str) -> Result<(), BoxError> {
        self.send(&Message::not_ack_for(message, reason)?).await
    }

    /// Next message, or an error on timeout or end of stream.
    pub async fn recv(&mut self) -> Result<Message, BoxError> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(message);
        }
        tokio::time::timeout(self.recv_timeout, self.read_one())
            .await
            .map_err(|_| "timed out waiting for a message")?
    }

    /// First message satisfying `accept`. Messages read past on the way are
    /// kept for later `recv` calls.
    pub async fn recv_matching(
        &mut self,
        mut accept: impl FnMut(&Message) -> bool,
    ) -> Result<Message, BoxError> {
        if let Some(pos) = self.backlog.iter().position(&mut accept) {
            if let Some(message) = self.backlog.remove(pos) {
                return Ok(message);
            }
        }
        let recv_timeout = self.recv_timeout;
        let wait = async {
            loop {
                let message = self.read_one().await?;
                if accept(&message) {
                    return Ok(message);
                }
                self.backlog.push_back(message);
            }
        };
        tokio::time::timeout(recv_timeout, wait)
            .await
            .map_err(|_| "timed out waiting for a matching message")?
    }

    /// Drop everything read so far but not yet consumed.
    pub fn clear_backlog(&mut self) {
        self.backlog.clear();
    }

    async fn read_one(&mut self) -> Result<Message, BoxError> {
        let record = self.read.next().await.ok_or("connection closed")??;
        let value = Message::parse_attributes(&record)?;
        let message = Message::build(value, &record)?;
        if self.auto_ack && !message.message_type().is_acknowledgement() {
            self.ack(&message).await?;
        }
        Ok(message)
    }

    /// Next message whose `type` is `type_name`.
    pub async fn expect(&mut self, type_name: &str) -> Result<Message, BoxError> {
        self.recv_matching(|m| m.type_name() == type_name).await
    }

    /// The MessageAck or MessageNotAck referring to `m_id`.
    pub async fn expect_ack_of(&mut self, m_id: &str) -> Result<Message, BoxError> {
        self.recv_matching(|m| {
            m.message_type().is_acknowledgement() && m.original_m_id() == Some(m_id)
        })
        .await
    }

    /// True when the peer closes the connection within `within`.
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        let wait = async {
            loop {
                match self.read.next().await {
                    None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        };
        tokio::time::timeout(within, wait).await.is_ok()
    }

    // -----------------------------------------------------------------------
    // Handshakes
    // -----------------------------------------------------------------------

    /// Play the supervisor side: take the site's Version, answer with
    /// `core_version`, and wait for our Version to be acknowledged. Returns
    /// the site's Version message. Auto-ack is on afterwards.
    pub async fn handshake_as_supervisor(&mut self, core_version: &str) -> Result<Message, BoxError> {
        let version = self.expect("Version").await?;
        self.ack(&version).await?;
        let site_ids = version.site_ids()?;
        let sxl = version.sxl_version().unwrap_or_default().to_owned();
        let reply = Message::version(&site_ids, &[core_version.to_owned()], &sxl);
        self.send(&reply).await?;
        // The site turns ready as soon as it acks our Version and may start
        // sending right away.
        self.auto_ack = true;
        let ack = self.expect_ack_of(reply.m_id().unwrap_or_default()).await?;
        if ack.message_type() != MessageType::MessageAck {
            return Err(format!("Version not acknowledged: {:?}", ack.reason()).into());
        }
        Ok(version)
    }

    /// Play the site side: send a Version, wait for its acknowledgement and
    /// the supervisor's Version, and acknowledge that. Returns the
    /// supervisor's Version message. Auto-ack is on afterwards.
    pub async fn handshake_as_site(
        &mut self,
        site_id: &str,
        core_versions: &[&str],
        sxl_version: &str,
    ) -> Result<Message, BoxError> {
        let versions: Vec<String> = core_versions.iter().map(|v| (*v).to_owned()).collect();
        let version = Message::version(&[site_id.to_owned()], &versions, sxl_version);
        self.send(&version).await?;
        let ack = self.expect_ack_of(version.m_id().unwrap_or_default()).await?;
        if ack.message_type() != MessageType::MessageAck {
            return Err(format!("Version rejected: {:?}", ack.reason()).into());
        }
        let reply = self.expect("Version").await?;
        self.auto_ack = true;
        self.ack(&reply).await?;
        Ok(reply)
    }

    pub async fn send_watchdog(&mut self) -> Result<Message, BoxError> {
        let watchdog = Message::watchdog(Utc::now());
        self.send(&watchdog).await?;
        Ok(watchdog)
    }
}

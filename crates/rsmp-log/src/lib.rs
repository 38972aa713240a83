use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rsmp_protocol::{Direction, Message};
use tokio::sync::broadcast;
use tracing::Level;

const CHANNEL_CAPACITY: usize = 256;

/// One archived event: a message that crossed a connection, or a note
/// (warning, error, state change) about one.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    /// Position in this archive, starting at 0. Never reused, even after
    /// older entries are evicted.
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub site_id: Option<String>,
    pub direction: Option<Direction>,
    pub message_type: Option<String>,
    pub m_id: Option<String>,
    pub text: String,
}

struct Ring {
    entries: VecDeque<ArchiveEntry>,
    next_index: u64,
}

/// Bounded in-memory record of protocol traffic.
///
/// Every entry is also published on a broadcast channel for live viewers and
/// echoed to `tracing`.
pub struct Archive {
    ring: RwLock<Ring>,
    max_entries: usize,
    tx: broadcast::Sender<ArchiveEntry>,
}

impl Archive {
    pub fn new(max_entries: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            ring: RwLock::new(Ring {
                entries: VecDeque::with_capacity(max_entries.min(1024)),
                next_index: 0,
            }),
            max_entries,
            tx,
        }
    }

    /// Live feed of new entries.
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEntry> {
        self.tx.subscribe()
    }

    /// Archive a message sent or received on a site's connection.
    pub fn record_message(&self, site_id: Option<&str>, message: &Message) -> Option<u64> {
        let text = message.raw().map(str::to_owned).unwrap_or_else(|| message.to_json());
        self.push(
            Level::DEBUG,
            site_id,
            message.direction(),
            Some(message.type_name().to_owned()),
            message.m_id().or(message.original_m_id()).map(str::to_owned),
            text,
        )
    }

    /// Archive a free-text note.
    pub fn log(&self, level: Level, site_id: Option<&str>, text: impl Into<String>) -> Option<u64> {
        self.push(level, site_id, None, None, None, text.into())
    }

    fn push(
        &self,
        level: Level,
        site_id: Option<&str>,
        direction: Option<Direction>,
        message_type: Option<String>,
        m_id: Option<String>,
        text: String,
    ) -> Option<u64> {
        let entry = {
            let mut ring = self.ring.write().ok()?;
            let entry = ArchiveEntry {
                index: ring.next_index,
                timestamp: Utc::now(),
                level,
                site_id: site_id.map(str::to_owned),
                direction,
                message_type,
                m_id,
                text,
            };
            ring.next_index += 1;
            ring.entries.push_back(entry.clone());
            while ring.entries.len() > self.max_entries {
                ring.entries.pop_front();
            }
            entry
        };
        echo(&entry);
        let _ = self.tx.send(entry.clone());
        Some(entry.index)
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<ArchiveEntry> {
        self.ring
            .read()
            .map(|ring| ring.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained entries with `index >= from`.
    pub fn entries_since(&self, from: u64) -> Vec<ArchiveEntry> {
        self.ring
            .read()
            .map(|ring| {
                ring.entries
                    .iter()
                    .filter(|e| e.index >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ring.read().map(|r| r.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn echo(entry: &ArchiveEntry) {
    let site = entry.site_id.as_deref().unwrap_or("-");
    let arrow = match entry.direction {
        Some(Direction::In) => "<--",
        Some(Direction::Out) => "-->",
        None => "   ",
    };
    match entry.level {
        Level::ERROR => tracing::error!(site_id = %site, "{} {}", arrow, entry.text),
        Level::WARN => tracing::warn!(site_id = %site, "{} {}", arrow, entry.text),
        Level::INFO => tracing::info!(site_id = %site, "{} {}", arrow, entry.text),
        _ => tracing::debug!(site_id = %site, "{} {}", arrow, entry.text),
    }
}

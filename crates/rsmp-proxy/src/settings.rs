use std::time::Duration;

use rsmp_protocol::SUPPORTED_CORE_VERSIONS;

/// Application-layer dialect spoken on top of core RSMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sxl {
    pub name: String,
    pub version: String,
}

impl Default for Sxl {
    fn default() -> Self {
        Sxl {
            name: "tlc".to_owned(),
            version: "1.2.1".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervals {
    /// Tick driving ack/watchdog checks and subscription updates.
    pub timer: Duration,
    pub watchdog: Duration,
    /// `None` disables reconnecting.
    pub reconnect: Option<Duration>,
}

impl Default for Intervals {
    fn default() -> Self {
        Intervals {
            timer: Duration::from_millis(100),
            watchdog: Duration::from_secs(1),
            reconnect: Some(Duration::from_millis(100)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub watchdog: Duration,
    pub acknowledgement: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(1),
            watchdog: Duration::from_secs(2),
            acknowledgement: Duration::from_secs(2),
        }
    }
}

/// Per-connection settings.
///
/// `site_id` always names the site end of the connection: a site's own id on
/// the site side, the remote site's id on the supervisor side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub site_id: String,
    pub sxl: Sxl,
    pub core_versions: Vec<String>,
    pub intervals: Intervals,
    pub timeouts: Timeouts,
    /// StatusUpdates kept while disconnected; the oldest is dropped when full.
    pub buffer_capacity: usize,
}

impl ProxySettings {
    pub fn new(site_id: impl Into<String>) -> Self {
        ProxySettings {
            site_id: site_id.into(),
            sxl: Sxl::default(),
            core_versions: SUPPORTED_CORE_VERSIONS
                .iter()
                .map(|v| (*v).to_owned())
                .collect(),
            intervals: Intervals::default(),
            timeouts: Timeouts::default(),
            buffer_capacity: 1000,
        }
    }
}

//! Site configuration loading.
//!
//! TOML is the sole config source. Default config path:
//! `/etc/rsmp/site.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `site_id`
//! - At least one `[[supervisors]]` entry
//!
//! Durations are given in (fractional) seconds. `intervals.reconnect` may be
//! `"no"` to disable reconnecting.

use std::path::Path;
use std::time::Duration;

use rsmp_protocol::SUPPORTED_CORE_VERSIONS;
use rsmp_proxy::{ComponentKind, Intervals, ProxySettings, Sxl, Timeouts};
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_SUPERVISOR_PORT: u16 = 12111;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub schema_version: u32,
    pub site_id: String,
    pub sxl: Sxl,
    pub core_versions: Vec<String>,
    pub supervisors: Vec<SupervisorAddr>,
    pub intervals: Intervals,
    pub timeouts: Timeouts,
    pub buffer_capacity: usize,
    pub components: Vec<ComponentConfig>,
    pub statuses: Vec<StatusConfig>,
    pub alarms: Vec<AlarmConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorAddr {
    pub ip: String,
    pub port: u16,
}

impl SupervisorAddr {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentConfig {
    pub id: String,
    pub kind: ComponentKind,
}

/// Initial value of a status, before the application reports one.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusConfig {
    pub component: String,
    pub code: String,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmConfig {
    pub component: String,
    pub code: String,
    pub category: String,
    pub priority: u8,
}

impl SiteConfig {
    /// Settings for the connection to one supervisor.
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            site_id: self.site_id.clone(),
            sxl: self.sxl.clone(),
            core_versions: self.core_versions.clone(),
            intervals: self.intervals.clone(),
            timeouts: self.timeouts.clone(),
            buffer_capacity: self.buffer_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    site_id: Option<String>,
    core_versions: Option<Vec<String>>,
    buffer_capacity: Option<usize>,
    sxl: Option<RawSxl>,
    supervisors: Option<Vec<RawSupervisor>>,
    intervals: Option<RawIntervals>,
    timeouts: Option<RawTimeouts>,
    components: Option<Vec<RawComponent>>,
    statuses: Option<Vec<RawStatus>>,
    alarms: Option<Vec<RawAlarm>>,
}

#[derive(Debug, Deserialize)]
struct RawSxl {
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSupervisor {
    ip: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawReconnect {
    Seconds(f64),
    Word(String),
}

#[derive(Debug, Deserialize)]
struct RawIntervals {
    timer: Option<f64>,
    watchdog: Option<f64>,
    reconnect: Option<RawReconnect>,
}

#[derive(Debug, Deserialize)]
struct RawTimeouts {
    connect: Option<f64>,
    watchdog: Option<f64>,
    acknowledgement: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    component: Option<String>,
    code: Option<String>,
    name: Option<String>,
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawAlarm {
    component: Option<String>,
    code: Option<String>,
    category: Option<String>,
    priority: Option<u8>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load site config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<SiteConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load site config from the default path `/etc/rsmp/site.toml`.
pub fn load_config() -> Result<SiteConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/rsmp/site.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<SiteConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let site_id = raw
        .site_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("site_id".to_owned()))?;

    let sxl = match raw.sxl {
        Some(s) => {
            let default = Sxl::default();
            Sxl {
                name: s.name.unwrap_or(default.name),
                version: s.version.unwrap_or(default.version),
            }
        }
        None => Sxl::default(),
    };

    let core_versions = parse_core_versions(raw.core_versions)?;

    let raw_supervisors = raw
        .supervisors
        .ok_or_else(|| ConfigError::MissingField("supervisors".to_owned()))?;
    if raw_supervisors.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[supervisors]] entry is required".to_owned(),
        ));
    }
    let mut supervisors = Vec::with_capacity(raw_supervisors.len());
    for (i, s) in raw_supervisors.into_iter().enumerate() {
        let ip = s
            .ip
            .ok_or_else(|| ConfigError::MissingField(format!("supervisors[{}].ip", i)))?;
        supervisors.push(SupervisorAddr {
            ip,
            port: s.port.unwrap_or(DEFAULT_SUPERVISOR_PORT),
        });
    }

    let intervals = parse_intervals(raw.intervals)?;
    let timeouts = parse_timeouts(raw.timeouts)?;

    let mut components = Vec::new();
    for (i, c) in raw.components.unwrap_or_default().into_iter().enumerate() {
        let id = c
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("components[{}].id", i)))?;
        if components.iter().any(|existing: &ComponentConfig| existing.id == id) {
            return Err(ConfigError::InvalidValue(format!(
                "duplicate component id '{}'",
                id
            )));
        }
        let kind = parse_kind(c.kind.as_deref(), i)?;
        components.push(ComponentConfig { id, kind });
    }

    let mut statuses = Vec::new();
    for (i, s) in raw.statuses.unwrap_or_default().into_iter().enumerate() {
        let field = |name: &str| ConfigError::MissingField(format!("statuses[{}].{}", i, name));
        let status = StatusConfig {
            component: s.component.ok_or_else(|| field("component"))?,
            code: s.code.ok_or_else(|| field("code"))?,
            name: s.name.ok_or_else(|| field("name"))?,
            value: s.value.ok_or_else(|| field("value"))?,
        };
        require_component(&components, &status.component, "statuses", i)?;
        statuses.push(status);
    }

    let mut alarms = Vec::new();
    for (i, a) in raw.alarms.unwrap_or_default().into_iter().enumerate() {
        let field = |name: &str| ConfigError::MissingField(format!("alarms[{}].{}", i, name));
        let alarm = AlarmConfig {
            component: a.component.ok_or_else(|| field("component"))?,
            code: a.code.ok_or_else(|| field("code"))?,
            category: a.category.unwrap_or_else(|| "D".to_owned()),
            priority: a.priority.unwrap_or(2),
        };
        if !(1..=3).contains(&alarm.priority) {
            return Err(ConfigError::InvalidValue(format!(
                "alarms[{}].priority must be 1, 2 or 3, got {}",
                i, alarm.priority
            )));
        }
        require_component(&components, &alarm.component, "alarms", i)?;
        alarms.push(alarm);
    }

    Ok(SiteConfig {
        schema_version,
        site_id,
        sxl,
        core_versions,
        supervisors,
        intervals,
        timeouts,
        buffer_capacity: raw.buffer_capacity.unwrap_or(1000),
        components,
        statuses,
        alarms,
    })
}

// ---------------------------------------------------------------------------
// Field parsers
// ---------------------------------------------------------------------------

fn parse_core_versions(raw: Option<Vec<String>>) -> Result<Vec<String>, ConfigError> {
    let Some(versions) = raw else {
        return Ok(SUPPORTED_CORE_VERSIONS.iter().map(|v| (*v).to_owned()).collect());
    };
    if versions.is_empty() {
        return Err(ConfigError::InvalidValue(
            "core_versions must not be empty".to_owned(),
        ));
    }
    if let Some(unknown) = versions
        .iter()
        .find(|v| !SUPPORTED_CORE_VERSIONS.contains(&v.as_str()))
    {
        return Err(ConfigError::InvalidValue(format!(
            "unsupported core version '{}'",
            unknown
        )));
    }
    Ok(versions)
}

fn seconds(value: f64, field: &str) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be a positive number of seconds, got {}",
            field, value
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

fn parse_intervals(raw: Option<RawIntervals>) -> Result<Intervals, ConfigError> {
    let defaults = Intervals::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };
    let reconnect = match raw.reconnect {
        None => defaults.reconnect,
        Some(RawReconnect::Seconds(s)) => Some(seconds(s, "intervals.reconnect")?),
        Some(RawReconnect::Word(word)) if word.eq_ignore_ascii_case("no") => None,
        Some(RawReconnect::Word(word)) => {
            return Err(ConfigError::InvalidValue(format!(
                "intervals.reconnect must be seconds or \"no\", got '{}'",
                word
            )));
        }
    };
    Ok(Intervals {
        timer: raw
            .timer
            .map(|s| seconds(s, "intervals.timer"))
            .transpose()?
            .unwrap_or(defaults.timer),
        watchdog: raw
            .watchdog
            .map(|s| seconds(s, "intervals.watchdog"))
            .transpose()?
            .unwrap_or(defaults.watchdog),
        reconnect,
    })
}

fn parse_timeouts(raw: Option<RawTimeouts>) -> Result<Timeouts, ConfigError> {
    let defaults = Timeouts::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };
    let pick = |value: Option<f64>, field: &str, default: Duration| {
        value.map(|s| seconds(s, field)).transpose().map(|d| d.unwrap_or(default))
    };
    Ok(Timeouts {
        connect: pick(raw.connect, "timeouts.connect", defaults.connect)?,
        watchdog: pick(raw.watchdog, "timeouts.watchdog", defaults.watchdog)?,
        acknowledgement: pick(
            raw.acknowledgement,
            "timeouts.acknowledgement",
            defaults.acknowledgement,
        )?,
    })
}

fn parse_kind(kind: Option<&str>, index: usize) -> Result<ComponentKind, ConfigError> {
    match kind {
        None | Some("other") => Ok(ComponentKind::Other),
        Some("main") => Ok(ComponentKind::Main),
        Some("signal_group") => Ok(ComponentKind::SignalGroup),
        Some("detector") => Ok(ComponentKind::Detector),
        Some(other) => Err(ConfigError::InvalidValue(format!(
            "components[{}].type must be main, signal_group, detector or other, got '{}'",
            index, other
        ))),
    }
}

fn require_component(
    components: &[ComponentConfig],
    id: &str,
    section: &str,
    index: usize,
) -> Result<(), ConfigError> {
    if components.iter().any(|c| c.id == id) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(format!(
            "{}[{}] refers to unknown component '{}'",
            section, index, id
        )))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

//! Supervisor configuration loading.
//!
//! TOML is the sole config source. Default config path:
//! `/etc/rsmp/supervisor.toml`.
//!
//! Sites are listed under `[sites."<site id>"]`. A site id without an entry
//! connects with the `[guest]` profile, or is refused when there is none.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rsmp_protocol::SUPPORTED_CORE_VERSIONS;
use rsmp_proxy::{Intervals, ProxySettings, Sxl, Timeouts};
use serde::Deserialize;

pub const DEFAULT_BIND: &str = "0.0.0.0:12111";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub schema_version: u32,
    pub bind: String,
    pub core_versions: Vec<String>,
    pub intervals: Intervals,
    pub timeouts: Timeouts,
    pub buffer_capacity: usize,
    pub sites: BTreeMap<String, SiteProfile>,
    pub guest: Option<SiteProfile>,
}

/// What the supervisor expects from one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteProfile {
    pub sxl: Sxl,
    /// Overrides the supervisor-wide list when set.
    pub core_versions: Option<Vec<String>>,
}

impl SupervisorConfig {
    /// Profile for `site_id`, falling back to the guest profile.
    pub fn profile(&self, site_id: &str) -> Option<&SiteProfile> {
        self.sites.get(site_id).or(self.guest.as_ref())
    }

    /// Connection settings for `site_id`, or `None` when the site is not
    /// allowed to connect.
    pub fn proxy_settings(&self, site_id: &str) -> Option<ProxySettings> {
        let profile = self.profile(site_id)?;
        Some(ProxySettings {
            site_id: site_id.to_owned(),
            sxl: profile.sxl.clone(),
            core_versions: profile
                .core_versions
                .clone()
                .unwrap_or_else(|| self.core_versions.clone()),
            intervals: self.intervals.clone(),
            timeouts: self.timeouts.clone(),
            buffer_capacity: self.buffer_capacity,
        })
    }
}

// ---------------------------------------------------------------------------
// Raw TOML types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    bind: Option<String>,
    core_versions: Option<Vec<String>>,
    buffer_capacity: Option<usize>,
    intervals: Option<RawIntervals>,
    timeouts: Option<RawTimeouts>,
    sites: Option<BTreeMap<String, RawProfile>>,
    guest: Option<RawProfile>,
}

#[derive(Debug, Deserialize)]
struct RawIntervals {
    timer: Option<f64>,
    watchdog: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTimeouts {
    connect: Option<f64>,
    watchdog: Option<f64>,
    acknowledgement: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawSxl {
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    sxl: Option<RawSxl>,
    core_versions: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load supervisor config from the default path `/etc/rsmp/supervisor.toml`.
pub fn load_config() -> Result<SupervisorConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/rsmp/supervisor.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<SupervisorConfig, ConfigError> {
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

    let core_versions = match raw.core_versions {
        Some(versions) => check_versions(versions, "core_versions")?,
        None => SUPPORTED_CORE_VERSIONS.iter().map(|v| (*v).to_owned()).collect(),
    };

    let mut sites = BTreeMap::new();
    for (site_id, profile) in raw.sites.unwrap_or_default() {
        if site_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue("site ids must not be empty".to_owned()));
        }
        let profile = parse_profile(profile, &format!("sites.{}", site_id))?;
        sites.insert(site_id, profile);
    }
    let guest = raw
        .guest
        .map(|profile| parse_profile(profile, "guest"))
        .transpose()?;
    if sites.is_empty() && guest.is_none() {
        return Err(ConfigError::MissingField(
            "sites (or a [guest] profile)".to_owned(),
        ));
    }

    let defaults = Intervals::default();
    let intervals = match raw.intervals {
        Some(i) => Intervals {
            timer: pick(i.timer, "intervals.timer", defaults.timer)?,
            watchdog: pick(i.watchdog, "intervals.watchdog", defaults.watchdog)?,
            reconnect: None,
        },
        None => Intervals {
            reconnect: None,
            ..defaults
        },
    };

    let defaults = Timeouts::default();
    let timeouts = match raw.timeouts {
        Some(t) => Timeouts {
            connect: pick(t.connect, "timeouts.connect", defaults.connect)?,
            watchdog: pick(t.watchdog, "timeouts.watchdog", defaults.watchdog)?,
            acknowledgement: pick(
                t.acknowledgement,
                "timeouts.acknowledgement",
                defaults.acknowledgement,
            )?,
        },
        None => defaults,
    };

    Ok(SupervisorConfig {
        schema_version,
        bind: raw.bind.unwrap_or_else(|| DEFAULT_BIND.to_owned()),
        core_versions,
        intervals,
        timeouts,
        buffer_capacity: raw.buffer_capacity.unwrap_or(1000),
        sites,
        guest,
    })
}

fn parse_profile(raw: RawProfile, section: &str) -> Result<SiteProfile, ConfigError> {
    let default = Sxl::default();
    let sxl = match raw.sxl {
        Some(s) => Sxl {
            name: s.name.unwrap_or(default.name),
            version: s.version.unwrap_or(default.version),
        },
        None => default,
    };
    let core_versions = raw
        .core_versions
        .map(|v| check_versions(v, &format!("{}.core_versions", section)))
        .transpose()?;
    Ok(SiteProfile { sxl, core_versions })
}

fn check_versions(versions: Vec<String>, field: &str) -> Result<Vec<String>, ConfigError> {
    if versions.is_empty() {
        return Err(ConfigError::InvalidValue(format!("{} must not be empty", field)));
    }
    match versions
        .iter()
        .find(|v| !SUPPORTED_CORE_VERSIONS.contains(&v.as_str()))
    {
        Some(unknown) => Err(ConfigError::InvalidValue(format!(
            "{}: unsupported core version '{}'",
            field, unknown
        ))),
        None => Ok(versions),
    }
}

fn pick(value: Option<f64>, field: &str, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(s) if s.is_finite() && s > 0.0 => Ok(Duration::from_secs_f64(s)),
        Some(s) => Err(ConfigError::InvalidValue(format!(
            "{} must be a positive number of seconds, got {}",
            field, s
        ))),
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_site_overrides_versions() {
        let config = load_config_from_str(
            r#"
schema_version = 1
core_versions = ["3.1.5", "3.2"]

[sites."RN+SI0001"]
sxl = { version = "1.1" }
core_versions = ["3.1.5"]

[guest]
"#,
        )
        .unwrap();
        assert_eq!(config.bind, DEFAULT_BIND);

        let known = config.proxy_settings("RN+SI0001").unwrap();
        assert_eq!(known.core_versions, vec!["3.1.5".to_owned()]);
        assert_eq!(known.sxl.version, "1.1");
        assert_eq!(known.intervals.reconnect, None);

        let guest = config.proxy_settings("RN+SI0002").unwrap();
        assert_eq!(guest.site_id, "RN+SI0002");
        assert_eq!(guest.core_versions.len(), 2);
        assert_eq!(guest.sxl, Sxl::default());
    }

    #[test]
    fn unknown_site_without_guest_is_refused() {
        let config = load_config_from_str(
            "schema_version = 1\n[sites.\"RN+SI0001\"]\n",
        )
        .unwrap();
        assert!(config.proxy_settings("RN+SI0001").is_some());
        assert!(config.proxy_settings("RN+SI0009").is_none());
    }

    #[test]
    fn sites_or_guest_required() {
        let err = load_config_from_str("schema_version = 1").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }
}

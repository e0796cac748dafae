//! Configuration loading and persistence.
//!
//! Engine tunables live in `config.json` inside the platform config
//! directory (`rpc-presence/`). Environment variables prefixed with
//! `RPC_PRESENCE_` override file values.

// Rust guideline compliant 2026-02

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::constants::{
    port_range, ACTIVITY_REFRESH_INTERVAL, COMMAND_TIMEOUT, PROBE_TIMEOUT, RECONNECT_DELAY,
    RPC_HOST, RPC_PORT_COUNT, RPC_PORT_START,
};
use crate::locator::EndpointSettings;
use crate::session::EngineSettings;

const CONFIG_FILE: &str = "config.json";

/// Keys accepted by [`Config::get`] and [`Config::set`].
pub const KEYS: &[&str] = &[
    "host",
    "port_start",
    "port_count",
    "probe_timeout_ms",
    "command_timeout_secs",
    "refresh_interval_secs",
    "reconnect_delay_secs",
    "companion_url",
    "origin",
];

/// Persisted engine configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Loopback host the endpoint listens on.
    pub host: String,
    /// First candidate port.
    pub port_start: u16,
    /// Number of candidate ports.
    pub port_count: u16,
    /// Per-port probe budget in milliseconds.
    pub probe_timeout_ms: u64,
    /// Command response window in seconds.
    pub command_timeout_secs: u64,
    /// Activity keep-alive interval in seconds.
    pub refresh_interval_secs: u64,
    /// Reconnect delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Companion service base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companion_url: Option<String>,
    /// `Origin` header sent when connecting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: RPC_HOST.to_string(),
            port_start: RPC_PORT_START,
            port_count: RPC_PORT_COUNT,
            probe_timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
            command_timeout_secs: COMMAND_TIMEOUT.as_secs(),
            refresh_interval_secs: ACTIVITY_REFRESH_INTERVAL.as_secs(),
            reconnect_delay_secs: RECONNECT_DELAY.as_secs(),
            companion_url: None,
            origin: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `RPC_PRESENCE_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("RPC_PRESENCE_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("rpc-presence"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir`, falling back to defaults.
    pub fn load_from(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str(&content).map_err(anyhow::Error::from))
        {
            Ok(config) => config,
            Err(e) => {
                log::warn!("[Config] Ignoring unreadable {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `RPC_PRESENCE_<KEY>` overrides from `lookup`.
    ///
    /// Values that do not parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in KEYS {
            let var = format!("RPC_PRESENCE_{}", key.to_uppercase());
            if let Some(value) = lookup(&var) {
                if let Err(e) = self.set(key, &value) {
                    log::warn!("[Config] Ignoring {}: {}", var, e);
                }
            }
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration as `config.json` in `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Reads one key as a display string.
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "host" => self.host.clone(),
            "port_start" => self.port_start.to_string(),
            "port_count" => self.port_count.to_string(),
            "probe_timeout_ms" => self.probe_timeout_ms.to_string(),
            "command_timeout_secs" => self.command_timeout_secs.to_string(),
            "refresh_interval_secs" => self.refresh_interval_secs.to_string(),
            "reconnect_delay_secs" => self.reconnect_delay_secs.to_string(),
            "companion_url" => self.companion_url.clone().unwrap_or_default(),
            "origin" => self.origin.clone().unwrap_or_default(),
            other => bail!("Unknown config key: {other}"),
        };
        Ok(value)
    }

    /// Sets one key from its string form. An empty value clears optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        match key {
            "host" => self.host = value.to_string(),
            "port_start" => self.port_start = parse(key, value)?,
            "port_count" => self.port_count = parse(key, value)?,
            "probe_timeout_ms" => self.probe_timeout_ms = parse(key, value)?,
            "command_timeout_secs" => self.command_timeout_secs = parse(key, value)?,
            "refresh_interval_secs" => self.refresh_interval_secs = parse(key, value)?,
            "reconnect_delay_secs" => self.reconnect_delay_secs = parse(key, value)?,
            "companion_url" => self.companion_url = optional(value),
            "origin" => self.origin = optional(value),
            other => bail!("Unknown config key: {other}"),
        }
        Ok(())
    }

    /// Engine settings described by this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            endpoint: EndpointSettings {
                host: self.host.clone(),
                ports: port_range(self.port_start, self.port_count),
                probe_timeout: Duration::from_millis(self.probe_timeout_ms),
                origin: self.origin.clone(),
            },
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            companion_url: self.companion_url.clone(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {key}: {value:?}"))
}

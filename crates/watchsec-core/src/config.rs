//! TOML configuration for the hub process.
//!
//! Every field has a default, so a missing file (or an empty one) yields a
//! runnable configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{DEFAULT_CAPTURE_INTERVAL_SECS, DEFAULT_MAX_TRACKED_AGENTS};
use crate::icap::{DEFAULT_ISTAG, DEFAULT_SERVICE};
use crate::smtp::DEFAULT_MAX_BODY_BYTES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub hub: HubSection,
    pub capture: CaptureSection,
    pub mail: MailSection,
    pub icap: IcapSection,
    pub commands: CommandSection,
    pub storage: StorageSection,
    pub admin: AdminSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub listen: String,
    pub max_connections: usize,
    /// Depth of each connection's outbound push queue.
    pub outbound_queue: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".into(),
            max_connections: 256,
            outbound_queue: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub interval_secs: i64,
    pub screenshots_dir: PathBuf,
    pub extension: String,
    /// Upper bound on agent ids with throttle state or a cached frame.
    pub max_tracked_agents: usize,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_CAPTURE_INTERVAL_SECS,
            screenshots_dir: PathBuf::from("Storage/Screenshots"),
            extension: "webp".into(),
            max_tracked_agents: DEFAULT_MAX_TRACKED_AGENTS,
        }
    }
}

impl CaptureSection {
    /// Throttle interval as a [`TimeDelta`]. Rejects non-positive values and
    /// values too large to represent.
    pub fn interval(&self) -> Result<TimeDelta, ConfigError> {
        TimeDelta::try_seconds(self.interval_secs)
            .filter(|d| *d > TimeDelta::zero())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "capture.interval_secs {} is out of range",
                    self.interval_secs
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSection {
    pub enabled: bool,
    pub listen: String,
    pub idle_timeout_secs: u64,
    pub max_line_len: usize,
    pub max_body_bytes: usize,
    pub greeting: String,
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:2525".into(),
            idle_timeout_secs: 300,
            max_line_len: 8192,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            greeting: "service ready".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcapSection {
    pub enabled: bool,
    pub listen: String,
    pub idle_timeout_secs: u64,
    pub service: String,
    pub istag: String,
}

impl Default for IcapSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:1344".into(),
            idle_timeout_secs: 60,
            service: DEFAULT_SERVICE.into(),
            istag: DEFAULT_ISTAG.into(),
        }
    }
}

/// How operator commands reach agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandDelivery {
    /// Only connections in the agent's group receive the command.
    #[default]
    Group,
    /// Every connection receives it; agents filter on the embedded id.
    Broadcast,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSection {
    pub delivery: CommandDelivery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database: PathBuf::from("watchsec.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub socket: PathBuf,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/tmp/watchsec/admin.sock"),
        }
    }
}

impl HubConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or fall back to defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_addr("hub.listen", &self.hub.listen)?;
        parse_addr("mail.listen", &self.mail.listen)?;
        parse_addr("icap.listen", &self.icap.listen)?;

        if self.hub.max_connections == 0 {
            return Err(ConfigError::Invalid("hub.max_connections must be > 0".into()));
        }
        if self.hub.outbound_queue == 0 {
            return Err(ConfigError::Invalid("hub.outbound_queue must be > 0".into()));
        }
        self.capture.interval()?;
        if self.capture.max_tracked_agents == 0 {
            return Err(ConfigError::Invalid("capture.max_tracked_agents must be > 0".into()));
        }
        if self.capture.extension.is_empty() || self.capture.extension.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "capture.extension {:?} is not a file extension",
                self.capture.extension
            )));
        }
        if self.mail.idle_timeout_secs == 0 || self.icap.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle timeouts must be > 0".into()));
        }
        if self.mail.max_line_len == 0 {
            return Err(ConfigError::Invalid("mail.max_line_len must be > 0".into()));
        }
        Ok(())
    }

    pub fn hub_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("hub.listen", &self.hub.listen)
    }

    pub fn mail_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("mail.listen", &self.mail.listen)
    }

    pub fn icap_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("icap.listen", &self.icap.listen)
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{field} {value:?}: {e}")))
}

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::BackendConfig;
use crate::error::{Result, SessionError};

/// Session lifetime used when neither the config nor the caller picks one.
pub const DEFAULT_EXPIRY_SECONDS: u64 = 86_400;

const ENV_DEFAULT_EXPIRY: &str = "SESSION_KEEPER_DEFAULT_EXPIRY";
const ENV_TIMEZONE: &str = "SESSION_KEEPER_TIMEZONE";

fn default_expiry_seconds() -> u64 {
    DEFAULT_EXPIRY_SECONDS
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Service-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Lifetime of a session when the caller gives no override (0 means the default)
    #[serde(default = "default_expiry_seconds")]
    pub default_expiry_seconds: u64,

    /// Zone used to display expiry times. Never used for TTL arithmetic.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Storage backend
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_expiry_seconds: DEFAULT_EXPIRY_SECONDS,
            timezone: default_timezone(),
            backend: BackendConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SessionError::Config(format!("invalid config: {}", e)))
    }

    /// Default config file location (~/.session-keeper/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".session-keeper").join("config.toml"))
    }

    /// Load configuration.
    ///
    /// Precedence: environment > file > defaults. An explicit `path` must
    /// exist; the default location is used only if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let mut config = match file {
            Some(file) => {
                let text = std::fs::read_to_string(&file).map_err(|e| {
                    SessionError::Config(format!("failed to read {}: {}", file.display(), e))
                })?;
                debug!(path = %file.display(), "loaded config file");
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };

        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ENV_DEFAULT_EXPIRY) {
            self.default_expiry_seconds = value.trim().parse().map_err(|_| {
                SessionError::Config(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    ENV_DEFAULT_EXPIRY, value
                ))
            })?;
        }
        if let Ok(value) = std::env::var(ENV_TIMEZONE) {
            self.timezone = value;
        }
        Ok(())
    }

    /// Default lifetime in seconds, with 0 mapped to [`DEFAULT_EXPIRY_SECONDS`].
    pub fn effective_expiry_seconds(&self) -> u64 {
        if self.default_expiry_seconds == 0 {
            DEFAULT_EXPIRY_SECONDS
        } else {
            self.default_expiry_seconds
        }
    }

    /// Display zone. An unrecognized name is logged and replaced by UTC.
    pub fn display_zone(&self) -> DisplayZone {
        parse_timezone(&self.timezone).unwrap_or_else(|e| {
            warn!(timezone = %self.timezone, error = %e, "falling back to UTC");
            DisplayZone::UTC
        })
    }
}

/// Zone used to render expiry instants for people. Never used for arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayZone {
    /// IANA zone such as `Asia/Kolkata`, daylight saving included
    Named(Tz),
    /// Fixed offset such as `+05:30`
    Fixed(FixedOffset),
}

impl DisplayZone {
    pub const UTC: Self = Self::Named(Tz::UTC);

    /// `instant` as wall-clock time in this zone.
    pub fn render(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            Self::Named(tz) => instant.with_timezone(tz).fixed_offset(),
            Self::Fixed(offset) => instant.with_timezone(offset),
        }
    }
}

impl Default for DisplayZone {
    fn default() -> Self {
        Self::UTC
    }
}

impl std::fmt::Display for DisplayZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(tz) => write!(f, "{}", tz.name()),
            Self::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

/// Parse a display zone: an IANA name (`Europe/Paris`), `UTC`/`GMT`/`Z`
/// in any case (or empty), or a fixed offset such as `+05:30`.
pub fn parse_timezone(name: &str) -> Result<DisplayZone> {
    let name = name.trim();
    if name.is_empty() || ["utc", "gmt", "z"].contains(&name.to_lowercase().as_str()) {
        return Ok(DisplayZone::UTC);
    }
    if let Ok(tz) = name.parse::<Tz>() {
        return Ok(DisplayZone::Named(tz));
    }
    name.parse::<FixedOffset>()
        .map(DisplayZone::Fixed)
        .map_err(|_| SessionError::Config(format!("unknown timezone '{}'", name)))
}

//! Configuration parsing for the activation daemon.
//!
//! Settings are read from a TOML file with a `[daemon]` section for the
//! daemon itself and a `[groups]` section describing how group child
//! processes are launched.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StokerConfig {
    /// Daemon behavior.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// How group child processes are launched.
    #[serde(default)]
    pub groups: GroupsSection,
}

impl StokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate invariants the daemon relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.group_throttle == 0 {
            return Err(ConfigError::Validation(
                "daemon.group_throttle must be at least 1".to_string(),
            ));
        }
        if self.daemon.snapshot_threshold == 0 {
            return Err(ConfigError::Validation(
                "daemon.snapshot_threshold must be at least 1".to_string(),
            ));
        }
        if self.daemon.activate_retries == 0 {
            return Err(ConfigError::Validation(
                "daemon.activate_retries must be at least 1".to_string(),
            ));
        }
        if self.daemon.group_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "daemon.group_timeout must be positive".to_string(),
            ));
        }
        if self.groups.command.is_empty() {
            return Err(ConfigError::Validation(
                "groups.command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

const fn default_group_throttle() -> usize {
    3
}

const fn default_snapshot_threshold() -> usize {
    200
}

const fn default_activate_retries() -> usize {
    2
}

const fn default_group_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_unexport_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_unexport_wait() -> Duration {
    Duration::from_millis(10)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("stoker-state")
}

/// Settings for the daemon itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    /// Directory holding the operation journal and snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// How many group child processes may be starting up concurrently.
    #[serde(default = "default_group_throttle")]
    pub group_throttle: usize,

    /// Journal records written before the next full snapshot.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: usize,

    /// How long a freshly spawned group gets to report in before its
    /// creation is abandoned.
    #[serde(default = "default_group_timeout", with = "humantime_serde")]
    pub group_timeout: Duration,

    /// Budget for gracefully unexporting the daemon's interfaces during
    /// shutdown.
    #[serde(default = "default_unexport_timeout", with = "humantime_serde")]
    pub unexport_timeout: Duration,

    /// Pause between checks for in-flight calls while unexporting.
    #[serde(default = "default_unexport_wait", with = "humantime_serde")]
    pub unexport_wait: Duration,

    /// Attempts per activation before the failure is surfaced. The first
    /// attempt counts, so two attempts tolerate one group crash.
    #[serde(default = "default_activate_retries")]
    pub activate_retries: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            group_throttle: default_group_throttle(),
            snapshot_threshold: default_snapshot_threshold(),
            group_timeout: default_group_timeout(),
            unexport_timeout: default_unexport_timeout(),
            unexport_wait: default_unexport_wait(),
            activate_retries: default_activate_retries(),
        }
    }
}

fn default_group_command() -> String {
    "stoker-group".to_string()
}

/// How group child processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupsSection {
    /// Program to exec for each group, unless the group descriptor
    /// overrides it.
    #[serde(default = "default_group_command")]
    pub command: String,

    /// Arguments placed before any per-group options.
    #[serde(default)]
    pub options: Vec<String>,

    /// Arguments appended after all per-group options, conventionally a
    /// shared configuration for every group.
    #[serde(default)]
    pub config_options: Vec<String>,

    /// Default code location handed to groups whose descriptor does not
    /// name one.
    #[serde(default)]
    pub location: Option<String>,
}

impl Default for GroupsSection {
    fn default() -> Self {
        Self {
            command: default_group_command(),
            options: Vec::new(),
            config_options: Vec::new(),
            location: None,
        }
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

mod humantime_serde {
    //! Serde adapter for humantime-formatted durations.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

//! Renewal manager tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const fn default_round_trip_time() -> Duration {
    Duration::from_secs(10)
}

const fn default_batch_time_window() -> Duration {
    Duration::from_secs(300)
}

const fn default_min_tasks() -> usize {
    1
}

const fn default_max_tasks() -> usize {
    11
}

/// Configuration for a [`crate::renew::LeaseRenewalManager`].
///
/// The defaults match long-running service deployments: a generous bound
/// on remote round-trip time and a five minute batching window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RenewalConfig {
    /// Worst-case estimate of one remote renewal round trip. Every
    /// renewal is scheduled at least this far before its lease expires.
    #[serde(default = "default_round_trip_time", with = "humantime_serde")]
    pub round_trip_time: Duration,

    /// How far ahead of a due renewal the manager looks for other leases
    /// to fold into the same batched call.
    #[serde(default = "default_batch_time_window", with = "humantime_serde")]
    pub batch_time_window: Duration,

    /// Lower bound on renewal workers. Kept for configuration parity;
    /// tasks are spawned on demand so this does not reserve anything.
    #[serde(default = "default_min_tasks")]
    pub min_tasks: usize,

    /// Upper bound on concurrent renewal tasks, including the one slot
    /// permanently reserved for the queuer.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            round_trip_time: default_round_trip_time(),
            batch_time_window: default_batch_time_window(),
            min_tasks: default_min_tasks(),
            max_tasks: default_max_tasks(),
        }
    }
}

impl RenewalConfig {
    /// Validate invariants that the scheduling arithmetic relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.round_trip_time.is_zero() {
            return Err(ConfigError::validation("round_trip_time must be positive"));
        }
        if self.max_tasks < 2 {
            return Err(ConfigError::validation(
                "max_tasks must be at least 2 (one queuer plus one worker)",
            ));
        }
        if self.min_tasks > self.max_tasks {
            return Err(ConfigError::validation(
                "min_tasks must not exceed max_tasks",
            ));
        }
        Ok(())
    }

    /// Round-trip time in scheduling units (milliseconds).
    #[must_use]
    pub(crate) fn rtt_ms(&self) -> i64 {
        clamp_ms(self.round_trip_time)
    }

    /// Batching window in scheduling units (milliseconds).
    #[must_use]
    pub(crate) fn window_ms(&self) -> i64 {
        clamp_ms(self.batch_time_window)
    }
}

fn clamp_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Configuration rejected by [`RenewalConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid renewal configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

mod humantime_serde {
    //! Serde adapter for humantime-formatted durations (for example
    //! `"10s"` or `"5m"`).

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

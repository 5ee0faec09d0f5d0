//! Engine timing configuration
//!
//! Every wait in the engine is bounded. The bounds live here so they can be
//! tuned per deployment from YAML, and shrunk to milliseconds in tests.
//!
//! ```yaml
//! instance_poll:
//!   max_attempts: 60
//!   interval_ms: 5000
//! termination:
//!   max_attempts: 6
//!   initial_delay_ms: 5000
//!   max_delay_ms: 120000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, PollConfig, RetryConfig};
use crate::Result;

/// Serializable bounded polling settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Number of probes before giving up
    pub max_attempts: u32,
    /// Delay after the first unsuccessful probe, in milliseconds
    pub interval_ms: u64,
    /// Cap on the delay for exponential backoff, in milliseconds
    pub max_interval_ms: u64,
    /// Delay growth strategy
    pub backoff: Backoff,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval_ms: 5_000,
            max_interval_ms: 5_000,
            backoff: Backoff::Fixed,
        }
    }
}

impl PollSettings {
    /// Fixed-interval settings
    pub fn fixed(max_attempts: u32, interval_ms: u64) -> Self {
        Self {
            max_attempts,
            interval_ms,
            max_interval_ms: interval_ms,
            backoff: Backoff::Fixed,
        }
    }

    /// Exponential settings
    pub fn exponential(max_attempts: u32, interval_ms: u64, max_interval_ms: u64) -> Self {
        Self {
            max_attempts,
            interval_ms,
            max_interval_ms,
            backoff: Backoff::Exponential,
        }
    }

    /// Convert to a [`PollConfig`]
    pub fn to_poll_config(&self) -> PollConfig {
        PollConfig {
            max_attempts: self.max_attempts.max(1),
            interval: Duration::from_millis(self.interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms.max(self.interval_ms)),
            backoff: self.backoff,
        }
    }
}

/// Serializable retry settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of attempts; values below 1 are raised to 1
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// Convert to a [`RetryConfig`]
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Bounds for every wait the engine performs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wait for a created network resource to become readable
    pub consistency_poll: PollSettings,
    /// Wait for instances to reach running
    pub instance_poll: PollSettings,
    /// Wait for spot requests to be fulfilled
    pub spot_poll: PollSettings,
    /// Wait for asynchronous address tasks
    pub task_poll: PollSettings,
    /// Retries for transient errors on individual API calls
    pub api_retry: RetrySettings,
    /// Retries for instance termination during rollback and delete
    pub termination: RetrySettings,
    /// Upper bound on describe pages before the cursor is considered broken
    pub max_describe_pages: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            consistency_poll: PollSettings::exponential(10, 1_000, 10_000),
            instance_poll: PollSettings::fixed(60, 5_000),
            spot_poll: PollSettings::fixed(60, 5_000),
            task_poll: PollSettings::exponential(10, 1_000, 30_000),
            api_retry: RetrySettings::default(),
            // Six attempts, capped at two minutes apart: several minutes overall
            termination: RetrySettings {
                max_attempts: 6,
                initial_delay_ms: 5_000,
                max_delay_ms: 120_000,
                backoff_multiplier: 2.0,
            },
            max_describe_pages: 1_000,
        }
    }
}

impl EngineConfig {
    /// Tight bounds with millisecond delays, for tests and dry runs
    pub fn fast() -> Self {
        let retry = RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        };
        Self {
            consistency_poll: PollSettings::fixed(5, 1),
            instance_poll: PollSettings::fixed(10, 1),
            spot_poll: PollSettings::fixed(10, 1),
            task_poll: PollSettings::exponential(5, 1, 4),
            api_retry: retry.clone(),
            termination: retry,
            max_describe_pages: 100,
        }
    }

    /// Parse from YAML; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_termination_budget_spans_minutes() {
        let retry = EngineConfig::default().termination.to_retry_config();
        let total: Duration = (1..retry.max_attempts)
            .map(|a| retry.delay_for_attempt(a))
            .sum();
        assert!(total >= Duration::from_secs(120));
        assert!(retry.max_attempts > 1);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
instance_poll:
  max_attempts: 3
  interval_ms: 10
"#,
        )
        .unwrap();
        assert_eq!(config.instance_poll.max_attempts, 3);
        assert_eq!(config.instance_poll.backoff, Backoff::Fixed);
        assert_eq!(config.spot_poll, EngineConfig::default().spot_poll);
        assert_eq!(config.max_describe_pages, 1_000);
    }

    #[test]
    fn retry_settings_never_allow_unbounded_retries() {
        let config = EngineConfig::from_yaml_str(
            r#"
termination:
  max_attempts: 0
api_retry:
  max_attempts: 0
"#,
        )
        .unwrap();
        assert_eq!(config.termination.to_retry_config().max_attempts, 1);
        assert_eq!(config.api_retry.to_retry_config().max_attempts, 1);
    }

    #[test]
    fn poll_settings_never_allow_zero_attempts() {
        let poll = PollSettings::fixed(0, 10).to_poll_config();
        assert_eq!(poll.max_attempts, 1);
        assert_eq!(poll.interval, Duration::from_millis(10));
    }
}

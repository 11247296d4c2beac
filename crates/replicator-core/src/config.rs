//! Run configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) is a
//! valid configuration. Durations are stored as integer `*_secs` / `*_ms`
//! fields and converted on access.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::minter::TtlOverflow;
use crate::app::retry::RetryPolicy;
use crate::app::tracker::PollPolicy;

/// The service refuses delegation windows longer than this.
pub const MAX_DELEGATION_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

pub const DEFAULT_POPULATE_CONTENT: &str = "Sample blob content.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry settings for copy starts and delegation issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            self.max_attempts,
        )
    }
}

/// Copy status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// Per-copy completion timeout.
    pub timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_interval_ms: 10_000,
            multiplier: 1.5,
            timeout_secs: 300,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            multiplier: self.multiplier,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Worker pool size.
    pub concurrency: usize,
    pub delegation_window_secs: u64,
    /// How far the delegation window start is backdated.
    pub clock_skew_secs: u64,
    pub authorization_ttl_secs: u64,
    pub ttl_overflow: TtlOverflow,
    /// Smallest ttl worth minting when clamping.
    pub min_authorization_ttl_secs: u64,
    pub copy_start: RetryConfig,
    pub poll: PollConfig,
    pub max_remints: u32,
    /// Restarts of a copy that timed out. 0 reports the timeout.
    pub completion_retries: u32,
    pub grace_period_secs: u64,
    pub run_timeout_secs: Option<u64>,
    pub populate_count: usize,
    pub populate_content: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            delegation_window_secs: 3_600,
            clock_skew_secs: 300,
            authorization_ttl_secs: 900,
            ttl_overflow: TtlOverflow::Reject,
            min_authorization_ttl_secs: 60,
            copy_start: RetryConfig::default(),
            poll: PollConfig::default(),
            max_remints: 2,
            completion_retries: 0,
            grace_period_secs: 30,
            run_timeout_secs: None,
            populate_count: 100,
            populate_content: DEFAULT_POPULATE_CONTENT.to_string(),
        }
    }
}

impl ReplicationConfig {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Load from a TOML file. The result is not validated yet, so CLI
    /// overrides can still be applied.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw, &path.display().to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".into());
        }
        if self.delegation_window_secs == 0
            || self.delegation_window_secs > MAX_DELEGATION_WINDOW_SECS
        {
            return invalid(format!(
                "delegation_window_secs must be in 1..={MAX_DELEGATION_WINDOW_SECS}, got {}",
                self.delegation_window_secs
            ));
        }
        if self.authorization_ttl_secs == 0 {
            return invalid("authorization_ttl_secs must be positive".into());
        }
        if self.authorization_ttl_secs > self.delegation_window_secs {
            return invalid(format!(
                "authorization_ttl_secs ({}) exceeds delegation_window_secs ({})",
                self.authorization_ttl_secs, self.delegation_window_secs
            ));
        }
        if self.min_authorization_ttl_secs > self.authorization_ttl_secs {
            return invalid(format!(
                "min_authorization_ttl_secs ({}) exceeds authorization_ttl_secs ({})",
                self.min_authorization_ttl_secs, self.authorization_ttl_secs
            ));
        }
        if self.copy_start.max_attempts == 0 {
            return invalid("copy_start.max_attempts must be at least 1".into());
        }
        if !(self.copy_start.multiplier >= 1.0) {
            return invalid("copy_start.multiplier must be >= 1.0".into());
        }
        if self.poll.interval_ms == 0 || self.poll.max_interval_ms < self.poll.interval_ms {
            return invalid(
                "poll.interval_ms must be positive and not above poll.max_interval_ms".into(),
            );
        }
        if !(self.poll.multiplier >= 1.0) {
            return invalid("poll.multiplier must be >= 1.0".into());
        }
        if self.poll.timeout_secs == 0 {
            return invalid("poll.timeout_secs must be positive".into());
        }
        if self.run_timeout_secs == Some(0) {
            return invalid("run_timeout_secs must be positive when set".into());
        }
        Ok(())
    }

    pub fn delegation_window(&self) -> Duration {
        Duration::from_secs(self.delegation_window_secs)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    pub fn authorization_ttl(&self) -> Duration {
        Duration::from_secs(self.authorization_ttl_secs)
    }

    pub fn min_authorization_ttl(&self) -> Duration {
        Duration::from_secs(self.min_authorization_ttl_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

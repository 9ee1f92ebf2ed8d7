//! Engine configuration
//!
//! All sections deserialize from camelCase JSON and fall back to their
//! defaults field by field, so a partial config file is valid.

use crate::error::{ComplianceError, Result};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for `ComplianceService`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Outbox retry/backoff policy
    pub retry: RetryPolicy,
    /// Background drain loop settings
    pub drain: DrainConfig,
    /// Background compliance sweep settings
    pub sweep: SweepConfig,
    /// Statutory response windows
    pub deadlines: DeadlinePolicy,
    /// Upper bound on a single audit query page
    pub audit_page_limit: usize,
}

fn default_audit_page_limit() -> usize {
    500
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            drain: DrainConfig::default(),
            sweep: SweepConfig::default(),
            deadlines: DeadlinePolicy::default(),
            audit_page_limit: default_audit_page_limit(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file
    ///
    /// A missing file yields the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path).map_err(|e| {
            ComplianceError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config: CoreConfig = serde_json::from_str(&json).map_err(|e| {
            ComplianceError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        if config.audit_page_limit == 0 {
            config.audit_page_limit = default_audit_page_limit();
        }

        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }
}

/// Exponential backoff for outbox delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempts before an entry is marked `failed`
    pub max_attempts: u32,
    /// Base delay in milliseconds
    pub base_delay_ms: u64,
    /// Cap on the delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given number of failed attempts
    ///
    /// `base_delay * 2^(attempts - 1)`, capped at `max_delay`. Zero attempts
    /// means no wait.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether an entry with `attempts` failures has reached the ceiling
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// Background drain loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainConfig {
    /// Seconds between drain passes
    pub interval_secs: u64,
    /// Timeout for a single remote call
    pub request_timeout_secs: u64,
    /// Entities drained concurrently within one pass
    pub max_concurrent_entities: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            request_timeout_secs: 10,
            max_concurrent_entities: 8,
        }
    }
}

impl DrainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Background compliance sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SweepConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Hours an open critical deadline alert may stay unresolved before
    /// escalating to emergency
    pub escalate_after_hours: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            escalate_after_hours: 24,
        }
    }
}

/// Statutory response windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeadlinePolicy {
    /// Window to notify the regulator after a high/critical breach
    pub regulator_notification_hours: i64,
    /// Window to notify affected individuals
    pub user_notification_hours: i64,
    /// Window to answer a data-subject request
    pub request_response_days: i64,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            regulator_notification_hours: 72,
            user_notification_hours: 24,
            request_response_days: 30,
        }
    }
}

impl DeadlinePolicy {
    pub fn regulator_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.regulator_notification_hours)
    }

    pub fn user_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.user_notification_hours)
    }

    pub fn request_window(&self) -> ChronoDuration {
        ChronoDuration::days(self.request_response_days)
    }
}

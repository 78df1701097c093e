use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Reconnection behavior of the incremental dumper when the change stream connection drops.
///
/// Delays grow exponentially between attempts. Once `max_retry_duration_ms` has elapsed since
/// the first failure the dumper gives up and the job fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionConfig {
    /// Whether the dumper reconnects at all.
    ///
    /// When disabled a dropped connection fails the job immediately.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay before the first reconnection attempt, in milliseconds.
    #[serde(default = "default_initial_retry_delay_ms", alias = "initialretrydelayms")]
    pub initial_retry_delay_ms: u64,
    /// Upper bound for the delay between attempts, in milliseconds.
    #[serde(default = "default_max_retry_delay_ms", alias = "maxretrydelayms")]
    pub max_retry_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt. Must be >= 1.0.
    #[serde(default = "default_backoff_multiplier", alias = "backoffmultiplier")]
    pub backoff_multiplier: f64,
    /// Total time budget for reconnecting, in milliseconds.
    #[serde(default = "default_max_retry_duration_ms", alias = "maxretrydurationms")]
    pub max_retry_duration_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_initial_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    60000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_duration_ms() -> u64 {
    300000
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_duration_ms: default_max_retry_duration_ms(),
        }
    }
}

impl ReconnectionConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_millis(self.max_retry_duration_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "reconnection.backoffMultiplier".to_string(),
                constraint: "must be at least 1.0".to_string(),
            });
        }

        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "reconnection.initialRetryDelayMs".to_string(),
                constraint: "must not exceed maxRetryDelayMs".to_string(),
            });
        }

        Ok(())
    }
}

//! Reconnection bookkeeping for the incremental dumper.
//!
//! Delays grow exponentially with random jitter, and reconnecting stops once the configured
//! total duration has passed since the first failure of the current outage.

use std::time::Duration;

use rand::Rng;
use scaling_config::shared::ReconnectionConfig;
use tokio::time::Instant;

use crate::error::ScalingError;

/// State of the connection to the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting { attempt: u32 },
}

/// Decides whether and when to reconnect after the change stream failed.
#[derive(Debug)]
pub struct ReconnectionManager {
    config: ReconnectionConfig,
    status: ConnectionStatus,
    attempt_count: u32,
    first_failure: Option<Instant>,
    last_error: Option<ScalingError>,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectionConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Connected,
            attempt_count: 0,
            first_failure: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&ScalingError> {
        self.last_error.as_ref()
    }

    /// Returns `true` when `error` is a lost connection and the retry budget is not spent.
    pub fn should_retry(&self, error: &ScalingError) -> bool {
        self.config.enabled && error.kind().is_connection_loss() && !self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.outage_duration()
            .is_some_and(|elapsed| elapsed >= self.config.max_retry_duration())
    }

    /// Time since the first failure of the current outage.
    pub fn outage_duration(&self) -> Option<Duration> {
        self.first_failure.map(|first| first.elapsed())
    }

    pub fn record_failure(&mut self, error: ScalingError) {
        if self.first_failure.is_none() {
            self.first_failure = Some(Instant::now());
        }
        self.attempt_count += 1;
        self.last_error = Some(error);
        self.status = ConnectionStatus::Reconnecting {
            attempt: self.attempt_count,
        };
    }

    pub fn record_success(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.attempt_count = 0;
        self.first_failure = None;
        self.last_error = None;
    }

    /// Delay before the next attempt: exponential in the attempt count, capped, plus up to 30%
    /// jitter.
    pub fn next_backoff(&self) -> Duration {
        let exponent = self.attempt_count.saturating_sub(1) as i32;
        let delay_ms = self.config.initial_retry_delay_ms as f64
            * self.config.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.config.max_retry_delay_ms as f64);

        let jitter = rand::thread_rng().gen_range(0.0..0.3);

        Duration::from_millis((capped_ms * (1.0 + jitter)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn config() -> ReconnectionConfig {
        ReconnectionConfig {
            enabled: true,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_retry_duration_ms: 5000,
        }
    }

    fn connection_lost() -> ScalingError {
        ScalingError::from((ErrorKind::SourceConnectionFailed, "Connection reset"))
    }

    #[test]
    fn only_connection_losses_are_retried() {
        let manager = ReconnectionManager::new(config());

        assert!(manager.should_retry(&connection_lost()));
        assert!(!manager.should_retry(&ScalingError::from((
            ErrorKind::SourceReplicationCorrupted,
            "Checksum mismatch"
        ))));

        let disabled = ReconnectionManager::new(ReconnectionConfig {
            enabled: false,
            ..config()
        });
        assert!(!disabled.should_retry(&connection_lost()));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut manager = ReconnectionManager::new(config());

        manager.record_failure(connection_lost());
        let first = manager.next_backoff();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(130));

        for _ in 0..10 {
            manager.record_failure(connection_lost());
        }
        let capped = manager.next_backoff();
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1300));
        assert_eq!(
            manager.status(),
            &ConnectionStatus::Reconnecting { attempt: 11 }
        );

        manager.record_success();
        assert_eq!(manager.attempt_count(), 0);
        assert!(manager.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded_by_duration() {
        let mut manager = ReconnectionManager::new(config());
        manager.record_failure(connection_lost());
        assert!(!manager.is_exhausted());

        tokio::time::advance(Duration::from_millis(5000)).await;

        assert!(manager.is_exhausted());
        assert!(!manager.should_retry(&connection_lost()));
    }
}

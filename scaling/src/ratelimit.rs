//! Throughput limiters for the dump and import stages.
//!
//! A limiter is chosen by name from an [`AlgorithmConfig`] when the process context is built.
//! Supported names are [`QPS_RATE_LIMITER`] and [`NOOP_RATE_LIMITER`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scaling_config::shared::AlgorithmConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ErrorKind, ScalingResult};
use crate::scaling_error;

/// Name of the token bucket limiter counting operations per second.
pub const QPS_RATE_LIMITER: &str = "QPS";

/// Name of the limiter that never waits.
pub const NOOP_RATE_LIMITER: &str = "NOOP";

/// Property holding the allowed operations per second of the QPS limiter.
pub const QPS_KEY: &str = "qps";

/// Default allowed operations per second of the QPS limiter.
pub const DEFAULT_QPS: u32 = 50;

/// Throttles a stage by suspending it until enough permits are available.
#[async_trait]
pub trait RateLimitAlgorithm: fmt::Debug + Send + Sync {
    /// Name the algorithm was selected by.
    fn algorithm_type(&self) -> &'static str;

    /// Waits until `permits` operations are allowed.
    async fn acquire(&self, permits: u32);
}

/// Shared handle to a limiter.
pub type RateLimiter = Arc<dyn RateLimitAlgorithm>;

/// A validated limiter selection, resolved before the limiter itself is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitSpec {
    Qps(u32),
    Noop,
}

impl RateLimitSpec {
    /// Resolves a limiter by name. Unknown names and malformed properties are configuration
    /// errors.
    pub fn parse(config: &AlgorithmConfig) -> ScalingResult<Self> {
        match config.algorithm_type.to_ascii_uppercase().as_str() {
            QPS_RATE_LIMITER => {
                let qps = config.parse_prop_or(QPS_KEY, DEFAULT_QPS)?;
                if qps == 0 {
                    return Err(scaling_error!(
                        ErrorKind::ConfigError,
                        "QPS rate limiter needs a positive rate",
                        format!("{QPS_KEY}=0")
                    ));
                }

                Ok(RateLimitSpec::Qps(qps))
            }
            NOOP_RATE_LIMITER => Ok(RateLimitSpec::Noop),
            other => Err(scaling_error!(
                ErrorKind::UnknownAlgorithm,
                "Unknown rate limiter algorithm",
                other.to_string()
            )),
        }
    }

    pub fn build(self) -> RateLimiter {
        match self {
            RateLimitSpec::Qps(qps) => Arc::new(QpsRateLimitAlgorithm::new(qps)),
            RateLimitSpec::Noop => Arc::new(NoopRateLimitAlgorithm),
        }
    }
}

/// Resolves and builds a limiter in one step.
pub fn build_rate_limiter(config: &AlgorithmConfig) -> ScalingResult<RateLimiter> {
    RateLimitSpec::parse(config).map(RateLimitSpec::build)
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled at `qps` tokens per second, holding at most one second of tokens.
///
/// A request larger than the available tokens is admitted by borrowing against future refills.
/// The caller then sleeps until the debt is paid, which keeps the long run rate at `qps`.
#[derive(Debug)]
pub struct QpsRateLimitAlgorithm {
    qps: u32,
    bucket: Mutex<Bucket>,
}

impl QpsRateLimitAlgorithm {
    pub fn new(qps: u32) -> Self {
        Self {
            qps,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(qps),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn qps(&self) -> u32 {
        self.qps
    }
}

#[async_trait]
impl RateLimitAlgorithm for QpsRateLimitAlgorithm {
    fn algorithm_type(&self) -> &'static str {
        QPS_RATE_LIMITER
    }

    async fn acquire(&self, permits: u32) {
        let rate = f64::from(self.qps);
        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
            bucket.last_refill = now;

            bucket.tokens -= f64::from(permits);
            if bucket.tokens >= 0.0 {
                return;
            }

            Duration::from_secs_f64(-bucket.tokens / rate)
        };

        debug!(permits, wait_ms = wait.as_millis() as u64, "rate limited");
        tokio::time::sleep(wait).await;
    }
}

/// Limiter that admits everything immediately.
#[derive(Debug, Default)]
pub struct NoopRateLimitAlgorithm;

#[async_trait]
impl RateLimitAlgorithm for NoopRateLimitAlgorithm {
    fn algorithm_type(&self) -> &'static str {
        NOOP_RATE_LIMITER
    }

    async fn acquire(&self, _permits: u32) {}
}

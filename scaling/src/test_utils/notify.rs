use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

/// Upper bound for waiting on a pipeline state in tests.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`Notify`] whose waits fail the test instead of hanging it.
#[derive(Debug, Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self::with_timeout(notify, DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(notify: Arc<Notify>, timeout_duration: Duration) -> Self {
        Self {
            notify,
            timeout_duration,
        }
    }

    /// Waits for a notification.
    ///
    /// # Panics
    ///
    /// Panics when the timeout elapses first, which means the awaited state was never reached.
    pub async fn notified(&self) {
        if timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_err()
        {
            panic!(
                "notification timed out after {:?}, the awaited pipeline state was never reached",
                self.timeout_duration
            );
        }
    }
}

/// Polls `condition` on every change of `rx` until it holds.
///
/// # Panics
///
/// Panics when [`DEFAULT_NOTIFY_TIMEOUT`] elapses first.
pub(crate) async fn wait_until<T, F>(rx: &mut tokio::sync::watch::Receiver<T>, mut condition: F)
where
    F: FnMut(&T) -> bool,
{
    let waited = timeout(DEFAULT_NOTIFY_TIMEOUT, rx.wait_for(|value| condition(value))).await;
    match waited {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => panic!("watched state was dropped before the condition held"),
        Err(_) => panic!(
            "condition did not hold within {:?}",
            DEFAULT_NOTIFY_TIMEOUT
        ),
    }
}

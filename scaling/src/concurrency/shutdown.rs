//! Broadcast stop signal for pipeline stages.
//!
//! The signal is latched: a receiver created after [`ShutdownTx::shutdown`] still observes it.
//! Dropping every [`ShutdownTx`] is treated as a stop signal too, so a stage never outlives the
//! job that owned it.

use tokio::sync::watch;

/// Sending side of the stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

/// Receiving side of the stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

/// Result of an operation that may be interrupted by the stop signal.
///
/// `Shutdown` carries whatever partial state the operation had when it stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

/// Creates a new, unsignaled stop channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

impl ShutdownTx {
    /// Signals every current and future receiver to stop.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

impl ShutdownRx {
    /// Returns `true` once the stop signal was sent or every sender was dropped.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Waits until the stop signal is observed.
    ///
    /// Cancel safe, so it can be used as a `tokio::select!` branch.
    pub async fn wait(&mut self) {
        // An error means every sender is gone, which also stops the stage.
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

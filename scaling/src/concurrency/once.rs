//! Explicit initialize-once cell with a deferred constructor.

use std::fmt;
use std::sync::OnceLock;

/// A value built by a stored constructor the first time it is requested.
///
/// Concurrent first calls to [`InitOnce::get`] race on an atomic check-and-set: exactly one of
/// them runs the constructor and every caller receives the same value. Unlike a lazy static,
/// the cell is owned, so whoever owns it can ask whether it was ever built and tear the value
/// down explicitly.
pub struct InitOnce<T> {
    cell: OnceLock<T>,
    init: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> InitOnce<T> {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            cell: OnceLock::new(),
            init: Box::new(init),
        }
    }

    /// Returns the value, building it on first use.
    pub fn get(&self) -> &T {
        self.cell.get_or_init(|| (self.init)())
    }

    /// Returns the value only if it was already built.
    pub fn get_if_initialized(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: fmt::Debug> fmt::Debug for InitOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitOnce")
            .field("value", &self.cell.get())
            .finish()
    }
}

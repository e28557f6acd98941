//! Wall clock used to set the device time and stamp readings

use chrono::{DateTime, Local};
use std::sync::Arc;
use tokio::sync::watch;

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Current time, or `None` while the clock is not yet synchronised
    fn now(&self) -> Option<DateTime<Local>>;

    /// Notifications fired each time the clock is set
    ///
    /// Clocks that follow the host time never change abruptly and return
    /// `None`.
    fn subscribe(&self) -> Option<watch::Receiver<Option<DateTime<Local>>>> {
        None
    }
}

/// Host system clock, always valid
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Option<DateTime<Local>> {
        Some(Local::now())
    }
}

/// Clock set by hand, invalid until the first `set`
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<watch::Sender<Option<DateTime<Local>>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            time: Arc::new(watch::Sender::new(None)),
        }
    }
}

impl ManualClock {
    /// Create an unsynchronised clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current time and notify subscribers
    pub fn set(&self, time: DateTime<Local>) {
        self.time.send_replace(Some(time));
    }

    /// Mark the clock unsynchronised
    pub fn invalidate(&self) {
        self.time.send_replace(None);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Option<DateTime<Local>> {
        *self.time.borrow()
    }

    fn subscribe(&self) -> Option<watch::Receiver<Option<DateTime<Local>>>> {
        Some(self.time.subscribe())
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delays {
    /// Wait before pausing a background instance after it changes state.
    pub pause: u64,
    /// Wait after resetting the active instance before returning to the grid.
    pub reset: u64,
    /// Wait before rebooting a failed worker.
    pub reboot: u64,
    /// Wait before resizing an instance that is about to be played.
    pub stretch: u64,
    /// State source polling interval.
    pub poll: u64,
    /// Wait for a freshly opened grid window to appear.
    pub spawn: u64,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            pause: 50,
            reset: 50,
            reboot: 10,
            stretch: 0,
            poll: 25,
            spawn: 500,
        }
    }
}

impl Delays {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause)
    }

    pub fn reset(&self) -> Duration {
        Duration::from_millis(self.reset)
    }

    pub fn reboot(&self) -> Duration {
        Duration::from_millis(self.reboot)
    }

    pub fn stretch(&self) -> Duration {
        Duration::from_millis(self.stretch)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll)
    }

    pub fn spawn(&self) -> Duration {
        Duration::from_millis(self.spawn)
    }
}

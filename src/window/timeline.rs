//! Per-window timestamp bookkeeping for synthetic key events.
//!
//! The target application drops injected key events unless two rules hold for
//! every window:
//! - timestamps strictly increase;
//! - an event with the same key code as the previous one is at least
//!   [`SAME_KEY_GAP`] later.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use super::{Keycode, Timestamp, WindowId};

pub const SAME_KEY_GAP: Timestamp = 20;

#[derive(Debug, Clone, Copy)]
struct LastKey {
    time: Timestamp,
    code: Keycode,
}

/// Owned by a windowing client; the only way to advance it is [`KeyTimeline::stamp`].
#[derive(Debug, Default)]
pub struct KeyTimeline {
    last: Mutex<HashMap<WindowId, LastKey>>,
}

impl KeyTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the timestamp to send `code` to `window` with, no earlier than
    /// `requested`, and records it.
    pub fn stamp(&self, window: WindowId, code: Keycode, requested: Timestamp) -> Timestamp {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut time = requested;
        if let Some(prev) = last.get(&window) {
            if prev.time >= time {
                time = prev.time.saturating_add(1);
            }
            if prev.code == code {
                time = time.max(prev.time.saturating_add(SAME_KEY_GAP));
            }
        }
        last.insert(window, LastKey { time, code });
        time
    }

    pub fn last_time(&self, window: WindowId) -> Option<Timestamp> {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        last.get(&window).map(|k| k.time)
    }
}

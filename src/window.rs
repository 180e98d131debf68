//! Windowing collaborator.
//!
//! The protocol bindings live outside this crate; [`WindowClient`] is the
//! surface the workers and coordinators drive. Implementations own their
//! connection and a [`KeyTimeline`] so injected key events always satisfy the
//! target application's timing rules.

mod timeline;
mod types;

pub use timeline::{KeyTimeline, SAME_KEY_GAP};
pub use types::{
    CURRENT_TIME, Geometry, InputEvent, InputState, KEY_ESC, KEY_F1, KEY_F3, KEY_F6, Key, Keycode,
    Keymod, Point, Timestamp, WindowId,
};

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::WindowError;

pub trait WindowClient: Send + Sync {
    fn windows(&self) -> Result<Vec<WindowId>, WindowError>;

    fn window_title(&self, window: WindowId) -> Result<String, WindowError>;

    fn geometry(&self, window: WindowId) -> Result<Geometry, WindowError>;

    fn move_window(&self, window: WindowId, geometry: Geometry) -> Result<(), WindowError>;

    fn focused_window(&self) -> Result<WindowId, WindowError>;

    fn focus_window(&self, window: WindowId, time: Timestamp) -> Result<(), WindowError>;

    fn grab_key(&self, key: Key) -> Result<(), WindowError>;

    fn ungrab_key(&self, key: Key) -> Result<(), WindowError>;

    fn grab_pointer(&self, window: WindowId) -> Result<(), WindowError>;

    fn ungrab_pointer(&self) -> Result<(), WindowError>;

    /// Delivers one key event with exactly the given timestamp.
    fn send_raw_key(
        &self,
        window: WindowId,
        code: Keycode,
        state: InputState,
        time: Timestamp,
    ) -> Result<(), WindowError>;

    fn current_time(&self) -> Timestamp;

    fn subscribe(&self) -> broadcast::Receiver<InputEvent>;

    fn timeline(&self) -> &KeyTimeline;

    /// Stamps and sends one key event. Delivery errors are logged, not retried.
    fn send_key(
        &self,
        window: WindowId,
        code: Keycode,
        state: InputState,
        at: Timestamp,
    ) -> Timestamp {
        let requested = if at == CURRENT_TIME {
            self.current_time()
        } else {
            at
        };
        let time = self.timeline().stamp(window, code, requested);
        if let Err(err) = self.send_raw_key(window, code, state, time) {
            warn!(window, code, error = %err, "failed to send key event");
        }
        time
    }

    fn key_down(&self, window: WindowId, code: Keycode, at: Timestamp) -> Timestamp {
        self.send_key(window, code, InputState::Down, at)
    }

    fn key_up(&self, window: WindowId, code: Keycode, at: Timestamp) -> Timestamp {
        self.send_key(window, code, InputState::Up, at)
    }

    fn key_press(&self, window: WindowId, code: Keycode, at: Timestamp) -> Timestamp {
        let time = self.key_down(window, code, at);
        self.key_up(window, code, time)
    }

    /// Finds the first window whose title contains `needle`.
    fn find_window(&self, needle: &str) -> Result<Option<WindowId>, WindowError> {
        for window in self.windows()? {
            match self.window_title(window) {
                Ok(title) if title.contains(needle) => return Ok(Some(window)),
                _ => continue,
            }
        }
        Ok(None)
    }
}

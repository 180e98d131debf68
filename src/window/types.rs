use std::ops::BitOr;

use serde::{Deserialize, Serialize};

pub type WindowId = u32;
pub type Keycode = u8;

/// Windowing-server time in milliseconds with an arbitrary origin.
pub type Timestamp = u32;

/// Asks the client to substitute its current server time.
pub const CURRENT_TIME: Timestamp = 0;

pub const KEY_ESC: Keycode = 9;
pub const KEY_F1: Keycode = 67;
pub const KEY_F3: Keycode = 69;
pub const KEY_F6: Keycode = 72;

/// Modifier and pointer-button mask carried by key and pointer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keymod(pub u16);

impl Keymod {
    pub const NONE: Keymod = Keymod(0);
    pub const SHIFT: Keymod = Keymod(1 << 0);
    pub const LOCK: Keymod = Keymod(1 << 1);
    pub const CTRL: Keymod = Keymod(1 << 2);
    pub const ALT: Keymod = Keymod(1 << 3);
    pub const MOD2: Keymod = Keymod(1 << 4);
    pub const MOD3: Keymod = Keymod(1 << 5);
    pub const SUPER: Keymod = Keymod(1 << 6);
    pub const MOD5: Keymod = Keymod(1 << 7);
    pub const BUTTON1: Keymod = Keymod(1 << 8);

    pub fn contains(self, other: Keymod) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: Keymod) -> Keymod {
        Keymod(self.0 & !other.0)
    }
}

impl BitOr for Keymod {
    type Output = Keymod;

    fn bitor(self, rhs: Keymod) -> Keymod {
        Keymod(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub code: Keycode,
    #[serde(default)]
    pub modifiers: Keymod,
}

impl Key {
    pub const fn new(code: Keycode) -> Self {
        Self {
            code,
            modifiers: Keymod::NONE,
        }
    }

    pub const fn with_modifiers(code: Keycode, modifiers: Keymod) -> Self {
        Self { code, modifiers }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// User input observed by the windowing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Key {
        key: Key,
        state: InputState,
        time: Timestamp,
    },
    Button {
        button: u8,
        modifiers: Keymod,
        state: InputState,
        point: Point,
        window: WindowId,
        time: Timestamp,
    },
    Motion {
        modifiers: Keymod,
        point: Point,
        window: WindowId,
        time: Timestamp,
    },
    Focus {
        window: WindowId,
        time: Timestamp,
    },
}

impl InputEvent {
    pub fn time(&self) -> Timestamp {
        match *self {
            InputEvent::Key { time, .. }
            | InputEvent::Button { time, .. }
            | InputEvent::Motion { time, .. }
            | InputEvent::Focus { time, .. } => time,
        }
    }
}

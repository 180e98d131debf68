use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::window::{Keycode, WindowId};

/// Dense index of an instance, `0..N`.
pub type InstanceId = usize;

pub const LOG_FILE: &str = "logs/latest.log";
pub const STATUS_FILE: &str = "wpstateout.txt";

/// Identity of one running instance, fixed at discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub pid: u32,
    pub window: WindowId,
    pub dir: PathBuf,
    /// Minor game version, e.g. `16` for 1.16.1.
    pub version: u32,
    /// Whether the instance writes the status file.
    pub status_output: bool,
    pub reset_key: Keycode,
    pub preview_key: Keycode,
}

impl InstanceInfo {
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StateKind {
    /// Title screen or any menu outside a world.
    #[default]
    Menu,
    /// World generation in progress.
    Dirt,
    /// Generation preview screen.
    Preview,
    /// In a generated world, paused, not yet played.
    Idle,
    /// In a world the user is playing.
    Ingame,
}

impl StateKind {
    pub fn is_generating(self) -> bool {
        self == StateKind::Dirt
    }

    /// Eligible for play, reset-others and auto-play.
    pub fn is_ready(self) -> bool {
        self == StateKind::Idle
    }
}

impl Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StateKind::Menu => write!(f, "menu"),
            StateKind::Dirt => write!(f, "dirt"),
            StateKind::Preview => write!(f, "preview"),
            StateKind::Idle => write!(f, "idle"),
            StateKind::Ingame => write!(f, "ingame"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Mutable lifecycle snapshot; written only by the instance's worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceState {
    pub kind: StateKind,
    /// World generation progress, 0 to 100.
    pub progress: u8,
    /// Paused or in a submenu. Only the status reader can see this.
    pub menu: bool,
    pub spawn: Option<Position>,
    pub last_preview: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
}

/// A state change of one instance, copied out of its worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub id: InstanceId,
    pub state: InstanceState,
    pub at: DateTime<Utc>,
}

impl Update {
    pub fn new(id: InstanceId, state: InstanceState) -> Self {
        Self {
            id,
            state,
            at: Utc::now(),
        }
    }
}

impl Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance {} -> {} ({}%)",
            self.id, self.state.kind, self.state.progress
        )
    }
}

mod delays;
mod keys;

pub use delays::Delays;
pub use keys::{CellAction, FIRST_CELL_KEYCODE, IGNORED_MODIFIERS, KeyConfig};

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    affinity::AffinityPolicy, error::ConfigError, hooks::Hooks, reader::ReaderChoice,
    worker::WorkerConfig,
};

/// Which coordinator strategy drives the instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorMode {
    /// Cycle through instances one at a time.
    Single,
    /// Show every instance on one grid window.
    #[default]
    Grid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// When a cell hidden on the dirt screen is shown again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ShowMethod {
    /// Some time after the preview starts.
    Delay { ms: u64 },
    /// Once preview progress passes `percent`.
    Progress { percent: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Substring of the grid window's title.
    pub window_title: String,
    pub use_pointer: bool,
    /// Shrink background instances to `stretch_size` and grow the played one.
    pub stretch_windows: bool,
    pub stretch_size: Size,
    /// Grid columns. Derived from the instance count when absent.
    pub columns: Option<u32>,
    /// After resetting the active instance, play a locked ready one instead of
    /// returning to the grid.
    pub auto_play_locked: bool,
    pub grid_scene: String,
    pub instance_scene_prefix: String,
    pub lock_item_prefix: String,
    /// Ask the overlay to open the grid window when none is found.
    pub spawn_grid_window: bool,
    /// Hide cells while their instance is on the dirt screen.
    pub hiding: Option<ShowMethod>,
    pub instance_item_prefix: String,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            window_title: "Projector (Scene)".to_string(),
            use_pointer: false,
            stretch_windows: false,
            stretch_size: Size {
                width: 1600,
                height: 300,
            },
            columns: None,
            auto_play_locked: false,
            grid_scene: "Wall".to_string(),
            instance_scene_prefix: "Instance ".to_string(),
            lock_item_prefix: "Lock ".to_string(),
            spawn_grid_window: true,
            hiding: None,
            instance_item_prefix: "Wall MC ".to_string(),
        }
    }
}

impl GridConfig {
    /// Overlay scene shown while `id` is played.
    pub fn instance_scene(&self, id: usize) -> String {
        format!("{}{}", self.instance_scene_prefix, id + 1)
    }

    /// Grid scene item marking `id` as locked.
    pub fn lock_item(&self, id: usize) -> String {
        format!("{}{}", self.lock_item_prefix, id + 1)
    }

    /// Grid scene item showing `id` itself.
    pub fn instance_item(&self, id: usize) -> String {
        format!("{}{}", self.instance_item_prefix, id + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: CoordinatorMode,
    pub keys: KeyConfig,
    pub delays: Delays,
    pub grid: GridConfig,
    pub reader: ReaderChoice,
    /// Hex SHA-256 digests of add-on jars that write the status file.
    pub status_output_digests: Vec<String>,
    /// Send an unpause key when a paused instance is focused.
    pub unpause_on_focus: bool,
    pub affinity: AffinityPolicy,
    pub hooks: Hooks,
    /// Keep the running reset count in this file.
    pub reset_count_path: Option<PathBuf>,
    /// Created while an instance is played, removed on return to the grid.
    pub sleepbg_lock: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: CoordinatorMode::default(),
            keys: KeyConfig::default(),
            delays: Delays::default(),
            grid: GridConfig::default(),
            reader: ReaderChoice::default(),
            status_output_digests: Vec::new(),
            unpause_on_focus: true,
            affinity: AffinityPolicy::default(),
            hooks: Hooks::default(),
            reset_count_path: None,
            sleepbg_lock: None,
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let conf = Self::from_json(&raw)?;
        debug!(path = %path.display(), mode = ?conf.mode, "loaded config");
        Ok(conf)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let conf: Config = serde_json::from_str(raw)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.cell_keycodes.is_empty() {
            return Err(ConfigError::Invalid(
                "keys.cell_keycodes must not be empty".into(),
            ));
        }
        let unique: HashSet<_> = self.keys.cell_keycodes.iter().collect();
        if unique.len() != self.keys.cell_keycodes.len() {
            return Err(ConfigError::Invalid(
                "keys.cell_keycodes contains duplicates".into(),
            ));
        }
        let modifiers: HashSet<_> = self.keys.cell_modifiers().into_iter().collect();
        if modifiers.len() != 4 {
            return Err(ConfigError::Invalid(
                "cell play/reset/reset_others/lock modifiers must differ".into(),
            ));
        }
        if let Some(key) = self.keys.play_first_locked
            && (key == self.keys.focus || key == self.keys.reset)
        {
            return Err(ConfigError::Invalid(
                "keys.play_first_locked must differ from focus and reset".into(),
            ));
        }
        if self.delays.poll == 0 {
            return Err(ConfigError::Invalid("delays.poll must be positive".into()));
        }
        if self.grid.columns == Some(0) {
            return Err(ConfigError::Invalid("grid.columns must be positive".into()));
        }
        if self.grid.stretch_windows
            && (self.grid.stretch_size.width == 0 || self.grid.stretch_size.height == 0)
        {
            return Err(ConfigError::Invalid(
                "grid.stretch_size must be non-zero".into(),
            ));
        }
        if let Some(ShowMethod::Progress { percent }) = self.grid.hiding
            && percent > 100
        {
            return Err(ConfigError::Invalid(
                "grid.hiding percent must be at most 100".into(),
            ));
        }
        self.affinity
            .validate_shape()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            reader: self.reader,
            pause_delay: self.delays.pause(),
            poll_interval: self.delays.poll(),
            unpause_on_focus: self.unpause_on_focus,
        }
    }
}

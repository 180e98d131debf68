use serde::{Deserialize, Serialize};

use crate::window::{KEY_F1, KEY_F6, Key, Keycode, Keymod};

/// First synthetic per-cell key code; cell `i` is bound to `10 + i`.
pub const FIRST_CELL_KEYCODE: Keycode = 10;
pub const DEFAULT_CELL_COUNT: Keycode = 10;

/// Modifier state bits that never distinguish one binding from another.
pub const IGNORED_MODIFIERS: Keymod = Keymod(Keymod::LOCK.0 | Keymod::MOD2.0);

/// What a per-cell key or pointer press asks the grid to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellAction {
    Play,
    Reset,
    ResetOthers,
    Lock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub focus: Key,
    pub reset: Key,
    pub cell_play: Keymod,
    pub cell_reset: Keymod,
    pub cell_reset_others: Keymod,
    pub cell_lock: Keymod,
    pub cell_keycodes: Vec<Keycode>,
    /// Plays the first locked ready instance from the grid.
    pub play_first_locked: Option<Key>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            focus: Key::with_modifiers(KEY_F1, Keymod::CTRL),
            reset: Key::with_modifiers(KEY_F6, Keymod::CTRL),
            cell_play: Keymod::NONE,
            cell_reset: Keymod::SHIFT,
            cell_reset_others: Keymod::CTRL,
            cell_lock: Keymod::ALT,
            cell_keycodes: (FIRST_CELL_KEYCODE..FIRST_CELL_KEYCODE + DEFAULT_CELL_COUNT).collect(),
            play_first_locked: None,
        }
    }
}

impl KeyConfig {
    /// Maps a modifier mask to the cell action bound to it, if any.
    pub fn cell_action(&self, modifiers: Keymod) -> Option<CellAction> {
        let modifiers = modifiers.without(IGNORED_MODIFIERS);
        if modifiers == self.cell_play {
            Some(CellAction::Play)
        } else if modifiers == self.cell_reset {
            Some(CellAction::Reset)
        } else if modifiers == self.cell_reset_others {
            Some(CellAction::ResetOthers)
        } else if modifiers == self.cell_lock {
            Some(CellAction::Lock)
        } else {
            None
        }
    }

    /// Cell index bound to `code`, if it is one of the per-cell key codes.
    pub fn cell_of(&self, code: Keycode) -> Option<usize> {
        self.cell_keycodes.iter().position(|&c| c == code)
    }

    pub fn cell_modifiers(&self) -> [Keymod; 4] {
        [
            self.cell_play,
            self.cell_reset,
            self.cell_reset_others,
            self.cell_lock,
        ]
    }

    /// Every per-cell binding for the first `cells` cells.
    pub fn cell_keys(&self, cells: usize) -> Vec<Key> {
        self.cell_keycodes
            .iter()
            .take(cells)
            .flat_map(|&code| {
                self.cell_modifiers()
                    .into_iter()
                    .map(move |m| Key::with_modifiers(code, m))
            })
            .collect()
    }

    /// Number of cells past the last bound key code.
    pub fn unreachable_cells(&self, cells: usize) -> usize {
        cells.saturating_sub(self.cell_keycodes.len())
    }

    /// Global keys match if their code matches and the modifiers agree once
    /// lock-style bits are ignored.
    pub fn matches(binding: Key, pressed: Key) -> bool {
        binding.code == pressed.code
            && binding.modifiers.without(IGNORED_MODIFIERS)
                == pressed.modifiers.without(IGNORED_MODIFIERS)
    }
}

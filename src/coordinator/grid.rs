use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::{CellAction, KeyConfig},
    error::CoordinatorError,
    hooks::HookKind,
    instance::InstanceId,
    overlay::OverlayOp,
    window::{Geometry, InputEvent, InputState, Key, Keymod, Point, Timestamp, WindowId},
};

use super::{Context, GridGeometry, pool::log_action};

/// Primary pointer button.
const BUTTON_LEFT: u8 = 1;

/// Every instance shown on one grid window, with per-cell hotkeys.
pub(super) struct Grid {
    window: WindowId,
    size: Geometry,
    geometry: GridGeometry,
    on_grid: bool,
    /// Played instance; meaningful only off the grid.
    current: InstanceId,
    locks: Vec<bool>,
    cell_keys: Vec<Key>,
    grabbed: bool,
    /// Cell under the held pointer button.
    dragged: Option<InstanceId>,
}

impl Grid {
    pub(super) async fn setup(ctx: &Context) -> Result<Self, CoordinatorError> {
        let count = ctx.pool.len();
        let window = find_grid_window(ctx).await?;
        let size = ctx.window.geometry(window)?;

        let canvas = match ctx.overlay.canvas_size().await {
            Some(Ok(canvas)) => Some(canvas),
            Some(Err(err)) => {
                warn!(error = %err, "failed to query overlay canvas, using window size");
                None
            }
            None => None,
        };
        let geometry = GridGeometry::new(count, ctx.conf.grid.columns, size, canvas);
        debug!(columns = geometry.columns, rows = geometry.rows, area = ?geometry.area, "grid geometry");

        let unreachable = ctx.conf.keys.unreachable_cells(count);
        if unreachable > 0 {
            warn!(
                instances = count,
                unreachable, "more instances than cell keys, extra cells only take the pointer"
            );
        }

        let mut grid = Self {
            window,
            size,
            geometry,
            on_grid: true,
            current: 0,
            locks: vec![false; count],
            cell_keys: ctx.conf.keys.cell_keys(count),
            grabbed: false,
            dragged: None,
        };

        if let Err(err) = ctx.window.focus_window(window, ctx.window.current_time()) {
            warn!(error = %err, "failed to focus grid window");
        }

        let grid_conf = &ctx.conf.grid;
        let mut ops = vec![OverlayOp::SetScene(grid_conf.grid_scene.clone())];
        ops.extend((0..count).map(|id| OverlayOp::SetVisible {
            scene: grid_conf.grid_scene.clone(),
            item: grid_conf.lock_item(id),
            visible: false,
        }));
        ctx.overlay.submit_batch(ops);

        if grid_conf.stretch_windows {
            for id in 0..count {
                grid.shrink(ctx, id).await;
            }
        }

        grid.grab(ctx);
        info!(window, instances = count, "grid ready");
        Ok(grid)
    }

    pub(super) async fn focus(&mut self, ctx: &Context, time: Timestamp) {
        if self.on_grid {
            if let Err(err) = ctx.window.focus_window(self.window, time) {
                warn!(error = %err, "failed to focus grid window");
            }
            return;
        }
        if let Some(worker) = ctx.pool.get(self.current) {
            log_action("focus", self.current, &worker.focus(time).await);
        }
    }

    pub(super) async fn reset(&mut self, ctx: &Context, time: Timestamp) {
        if self.on_grid {
            let unlocked = (0..self.locks.len()).filter(|&id| !self.locks[id]);
            self.reset_all(ctx, unlocked, time).await;
            return;
        }

        let id = self.current;
        let Some(worker) = ctx.pool.get(id) else {
            return;
        };
        if log_action("reset", id, &worker.reset(time).await) {
            ctx.on_reset(id);
        }
        if ctx.conf.grid.stretch_windows {
            self.shrink(ctx, id).await;
        }

        if ctx.conf.grid.auto_play_locked && self.play_first_locked(ctx, time).await {
            return;
        }
        self.enter_grid(ctx, time).await;
    }

    pub(super) async fn on_input(&mut self, ctx: &Context, event: &InputEvent) {
        match *event {
            InputEvent::Key {
                key,
                state: InputState::Down,
                time,
            } => {
                if !self.on_grid || !self.cell_keys.iter().any(|&k| KeyConfig::matches(k, key)) {
                    return;
                }
                let Some(id) = ctx.conf.keys.cell_of(key.code) else {
                    return;
                };
                if let Some(action) = ctx.conf.keys.cell_action(key.modifiers) {
                    self.dispatch(ctx, id, action, time).await;
                }
            }
            InputEvent::Button {
                button: BUTTON_LEFT,
                modifiers,
                state,
                point,
                time,
                ..
            } => match state {
                InputState::Down => {
                    self.dragged = None;
                    self.pointer(ctx, point, modifiers, time).await;
                }
                InputState::Up => self.dragged = None,
            },
            InputEvent::Motion {
                modifiers,
                point,
                time,
                ..
            } if modifiers.contains(Keymod::BUTTON1) => {
                self.pointer(ctx, point, modifiers, time).await;
            }
            _ => {}
        }
    }

    /// Maps a pointer position to a cell action, once per cell per drag.
    async fn pointer(&mut self, ctx: &Context, point: Point, modifiers: Keymod, time: Timestamp) {
        if !self.on_grid || !ctx.conf.grid.use_pointer {
            return;
        }
        let Some(id) = self.geometry.cell_at(point) else {
            return;
        };
        if self.dragged == Some(id) {
            return;
        }
        self.dragged = Some(id);

        if let Some(action) = ctx.conf.keys.cell_action(modifiers.without(Keymod::BUTTON1)) {
            self.dispatch(ctx, id, action, time).await;
        }
    }

    async fn dispatch(&mut self, ctx: &Context, id: InstanceId, action: CellAction, time: Timestamp) {
        if id >= self.locks.len() {
            return;
        }
        debug!(instance = id, ?action, "cell action");
        match action {
            CellAction::Play => {
                if ctx.is_ready(id) {
                    self.play(ctx, id, time).await;
                } else {
                    debug!(instance = id, "not ready to play");
                }
            }
            CellAction::Reset => {
                if self.locks[id] {
                    return;
                }
                if let Some(worker) = ctx.pool.get(id)
                    && log_action("reset", id, &worker.reset(time).await)
                {
                    ctx.on_reset(id);
                }
            }
            CellAction::ResetOthers => {
                if !ctx.is_ready(id) {
                    debug!(instance = id, "not ready to play");
                    return;
                }
                self.play(ctx, id, time).await;
                let others = (0..self.locks.len()).filter(|&i| i != id && !self.locks[i]);
                self.reset_all(ctx, others, time).await;
            }
            CellAction::Lock => self.set_lock(ctx, id, !self.locks[id]),
        }
    }

    /// Leaves the grid for instance `id` and unlocks it. The grid stays as it
    /// was when the instance cannot be focused.
    async fn play(&mut self, ctx: &Context, id: InstanceId, time: Timestamp) {
        let Some(worker) = ctx.pool.get(id) else {
            return;
        };
        if !log_action("play", id, &worker.focus(time).await) {
            return;
        }
        ctx.overlay.set_scene(ctx.conf.grid.instance_scene(id));
        self.ungrab(ctx);
        self.on_grid = false;
        self.current = id;
        ctx.sleepbg(true).await;

        if ctx.conf.grid.stretch_windows {
            sleep(ctx.conf.delays.stretch()).await;
            if let Err(err) = worker.resize(self.size.width, self.size.height).await {
                warn!(instance = id, error = %err, "failed to stretch window");
            }
        }
        self.set_lock(ctx, id, false);
        ctx.hook(HookKind::Play, id);
        info!(instance = id, "playing");
    }

    /// Plays the first locked instance that is ready. Returns whether one was.
    pub(super) async fn play_first_locked(&mut self, ctx: &Context, time: Timestamp) -> bool {
        let Some(id) = (0..self.locks.len()).find(|&i| self.locks[i] && ctx.is_ready(i)) else {
            return false;
        };
        debug!(instance = id, "playing first locked instance");
        self.play(ctx, id, time).await;
        true
    }

    /// The play-first-locked binding only acts on the grid.
    pub(super) async fn on_play_first_locked(&mut self, ctx: &Context, time: Timestamp) {
        if self.on_grid && !self.play_first_locked(ctx, time).await {
            debug!("no locked instance ready");
        }
    }

    async fn enter_grid(&mut self, ctx: &Context, time: Timestamp) {
        sleep(ctx.conf.delays.reset()).await;
        ctx.sleepbg(false).await;
        self.on_grid = true;
        self.grab(ctx);
        if let Err(err) = ctx.window.focus_window(self.window, time) {
            warn!(error = %err, "failed to focus grid window");
        }
        ctx.overlay.set_scene(ctx.conf.grid.grid_scene.clone());
        debug!("back on grid");
    }

    async fn reset_all<I>(&self, ctx: &Context, ids: I, time: Timestamp)
    where
        I: IntoIterator<Item = InstanceId>,
    {
        for (id, result) in ctx.pool.reset_many(ids, time).await {
            if log_action("reset", id, &result) {
                ctx.on_reset(id);
            }
        }
    }

    fn set_lock(&mut self, ctx: &Context, id: InstanceId, locked: bool) {
        if self.locks[id] == locked {
            return;
        }
        self.locks[id] = locked;
        ctx.overlay.submit(OverlayOp::SetVisible {
            scene: ctx.conf.grid.grid_scene.clone(),
            item: ctx.conf.grid.lock_item(id),
            visible: locked,
        });
        ctx.set_priority(id, locked);
        ctx.hook(if locked { HookKind::Lock } else { HookKind::Unlock }, id);
        debug!(instance = id, locked, "lock toggled");
    }

    async fn shrink(&self, ctx: &Context, id: InstanceId) {
        let size = ctx.conf.grid.stretch_size;
        if let Some(worker) = ctx.pool.get(id)
            && let Err(err) = worker.resize(size.width, size.height).await
        {
            warn!(instance = id, error = %err, "failed to shrink window");
        }
    }

    fn grab(&mut self, ctx: &Context) {
        if self.grabbed {
            return;
        }
        for &key in &self.cell_keys {
            if let Err(err) = ctx.window.grab_key(key) {
                warn!(code = key.code, error = %err, "failed to grab cell key");
            }
        }
        if ctx.conf.grid.use_pointer
            && let Err(err) = ctx.window.grab_pointer(self.window)
        {
            warn!(error = %err, "failed to grab pointer");
        }
        self.grabbed = true;
    }

    pub(super) fn ungrab(&mut self, ctx: &Context) {
        if !self.grabbed {
            return;
        }
        for &key in &self.cell_keys {
            if let Err(err) = ctx.window.ungrab_key(key) {
                warn!(code = key.code, error = %err, "failed to ungrab cell key");
            }
        }
        if ctx.conf.grid.use_pointer
            && let Err(err) = ctx.window.ungrab_pointer()
        {
            warn!(error = %err, "failed to ungrab pointer");
        }
        self.grabbed = false;
        self.dragged = None;
    }
}

/// Finds the grid window, asking the overlay to open it once if missing.
async fn find_grid_window(ctx: &Context) -> Result<WindowId, CoordinatorError> {
    let title = &ctx.conf.grid.window_title;
    if let Some(window) = ctx.window.find_window(title)? {
        return Ok(window);
    }
    if !ctx.conf.grid.spawn_grid_window {
        return Err(CoordinatorError::GridWindowMissing {
            title: title.clone(),
        });
    }

    match ctx.overlay.open_grid_window(&ctx.conf.grid.grid_scene).await {
        Some(Ok(())) => info!("asked overlay to open the grid window"),
        Some(Err(err)) => warn!(error = %err, "overlay failed to open the grid window"),
        None => {
            return Err(CoordinatorError::GridWindowMissing {
                title: title.clone(),
            });
        }
    }
    sleep(ctx.conf.delays.spawn()).await;
    ctx.window
        .find_window(title)?
        .ok_or_else(|| CoordinatorError::GridWindowMissing {
            title: title.clone(),
        })
}

//! Orchestration of every worker through one event loop.
//!
//! A [`Coordinator`] owns the lifecycle; the behaviour behind the hotkeys is
//! one of the [`CoordinatorMode`] strategies. All orchestration state (locks,
//! active instance, grid mode) lives in the loop task and is never shared.

mod geometry;
mod grid;
mod hider;
mod pool;
mod single;

pub use geometry::GridGeometry;
pub use pool::{MAX_REBOOTS, WorkerPool};

use std::{
    io,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use tokio::{
    sync::{Mutex, OwnedMutexGuard, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tracing::{debug, error, info, warn};

use crate::{
    affinity::{AffinityController, AffinityHandle, AffinitySink},
    config::{Config, CoordinatorMode, KeyConfig},
    counter::ResetCounter,
    error::{CoordinatorError, WorkerError},
    hooks::HookKind,
    instance::{InstanceId, InstanceInfo, InstanceState, StateKind, Update},
    overlay::{Overlay, OverlayOp, OverlaySink},
    window::{InputEvent, InputState, Key, Timestamp, WindowClient},
};

use grid::Grid;
use hider::Hider;
use single::Single;

const UPDATE_CAPACITY: usize = 1024;
const ERROR_CAPACITY: usize = 64;

/// External collaborators shared by every coordinator run.
#[derive(Clone)]
pub struct Collaborators {
    pub window: Arc<dyn WindowClient>,
    pub overlay: Option<Arc<dyn Overlay>>,
    pub affinity: Arc<dyn AffinitySink>,
}

type StopSender = mpsc::Sender<oneshot::Sender<()>>;
type LoopResult = Result<(), CoordinatorError>;

pub struct Coordinator {
    conf: Arc<Config>,
    deps: Collaborators,
    /// Held by a running loop, released by its last cleanup step.
    active: Arc<Mutex<()>>,
    stop: StdMutex<Option<StopSender>>,
    task: Mutex<Option<JoinHandle<LoopResult>>>,
}

impl Coordinator {
    pub fn new(conf: Arc<Config>, deps: Collaborators) -> Self {
        Self {
            conf,
            deps,
            active: Arc::new(Mutex::new(())),
            stop: StdMutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> CoordinatorMode {
        self.conf.mode
    }

    pub fn is_running(&self) -> bool {
        self.active.try_lock().is_err()
    }

    /// Starts the workers and the event loop. Startup failures are returned
    /// here with everything acquired so far released; later fatal failures
    /// come out of [`Coordinator::wait`].
    pub async fn start(&self, instances: Vec<InstanceInfo>) -> Result<(), CoordinatorError> {
        if instances.is_empty() {
            return Err(CoordinatorError::NoInstances);
        }
        let guard = self
            .active
            .clone()
            .try_lock_owned()
            .map_err(|_| CoordinatorError::AlreadyRunning)?;

        // Subscribe first so no input is missed during setup.
        let input = BroadcastStream::new(self.deps.window.subscribe());
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CAPACITY);

        let mut runner = Runner {
            ctx: Context {
                states: vec![InstanceState::default(); instances.len()],
                pool: WorkerPool::new(
                    instances,
                    self.conf.worker_config(),
                    self.deps.window.clone(),
                    updates_tx,
                    errors_tx,
                    self.conf.delays.reboot(),
                ),
                conf: self.conf.clone(),
                window: self.deps.window.clone(),
                overlay: OverlaySink::new(self.deps.overlay.clone()),
                affinity: None,
                counter: None,
                active: Some(guard),
                cleanup: vec![Cleanup::ReleaseActive],
            },
            strategy: None,
            hider: None,
        };

        if let Err(err) = runner.setup(self.deps.affinity.clone()).await {
            error!(error = %err, label = err.as_label(), "coordinator failed to start");
            runner.cleanup().await;
            return Err(err);
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);
        let handle = tokio::spawn(runner.run(stop_rx, updates_rx, errors_rx, input));
        *self.task.lock().await = Some(handle);
        info!(mode = ?self.conf.mode, "coordinator started");
        Ok(())
    }

    /// Asks the loop to clean up and waits until it has. Returns immediately
    /// when nothing is running.
    pub async fn stop(&self) {
        let tx = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(tx) = tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(ack_tx).await.is_ok() {
            _ = ack_rx.await;
        }
    }

    /// Waits for the loop to end and returns why it did.
    pub async fn wait(&self) -> Result<(), CoordinatorError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        *task = None;
        self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        match joined {
            Ok(result) => result,
            Err(err) => Err(CoordinatorError::Panicked(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    UngrabGlobal,
    UngrabGrid,
    StopAffinity,
    StopWorkers,
    CloseCounter,
    ReleaseActive,
}

/// State shared by both strategies, owned by the loop task.
pub(crate) struct Context {
    pub conf: Arc<Config>,
    pub window: Arc<dyn WindowClient>,
    pub overlay: OverlaySink,
    pub pool: WorkerPool,
    pub affinity: Option<AffinityHandle>,
    pub counter: Option<ResetCounter>,
    /// Latest state of every instance as published by its worker.
    pub states: Vec<InstanceState>,
    active: Option<OwnedMutexGuard<()>>,
    cleanup: Vec<Cleanup>,
}

impl Context {
    pub fn is_ready(&self, id: InstanceId) -> bool {
        self.states.get(id).is_some_and(|s| s.kind.is_ready())
    }

    pub fn set_priority(&self, id: InstanceId, priority: bool) {
        if let Some(affinity) = &self.affinity {
            affinity.set_priority(id, priority);
        }
    }

    pub fn hook(&self, kind: HookKind, id: InstanceId) {
        _ = self.conf.hooks.fire(kind, id);
    }

    /// Bookkeeping after a reset was sent to `id`.
    pub fn on_reset(&self, id: InstanceId) {
        if let Some(counter) = &self.counter {
            counter.increment();
        }
        self.hook(HookKind::Reset, id);
    }

    /// Creates the sleepbg lock while an instance is played and removes it
    /// once back on the grid.
    pub async fn sleepbg(&self, playing: bool) {
        let Some(path) = &self.conf.sleepbg_lock else {
            return;
        };
        let result = if playing {
            tokio::fs::write(path, b"").await
        } else {
            match tokio::fs::remove_file(path).await {
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        if let Err(err) = result {
            warn!(path = %path.display(), playing, error = %err, "failed to update sleepbg lock");
        }
    }

    fn global_keys(&self) -> Vec<Key> {
        let keys = &self.conf.keys;
        let mut global = vec![keys.focus, keys.reset];
        if self.conf.mode == CoordinatorMode::Grid {
            global.extend(keys.play_first_locked);
        }
        global
    }
}

enum Strategy {
    Single(Single),
    Grid(Grid),
}

impl Strategy {
    async fn on_focus_key(&mut self, ctx: &Context, time: Timestamp) {
        match self {
            Strategy::Single(s) => s.focus(ctx, time).await,
            Strategy::Grid(g) => g.focus(ctx, time).await,
        }
    }

    async fn on_reset_key(&mut self, ctx: &Context, time: Timestamp) {
        match self {
            Strategy::Single(s) => s.reset(ctx, time).await,
            Strategy::Grid(g) => g.reset(ctx, time).await,
        }
    }

    async fn on_play_first_locked(&mut self, ctx: &Context, time: Timestamp) {
        match self {
            Strategy::Single(_) => {}
            Strategy::Grid(g) => g.on_play_first_locked(ctx, time).await,
        }
    }

    async fn on_other(&mut self, ctx: &Context, event: &InputEvent) {
        match self {
            Strategy::Single(_) => {}
            Strategy::Grid(g) => g.on_input(ctx, event).await,
        }
    }
}

struct Runner {
    ctx: Context,
    strategy: Option<Strategy>,
    hider: Option<Hider>,
}

impl Runner {
    async fn setup(&mut self, sink: Arc<dyn AffinitySink>) -> Result<(), CoordinatorError> {
        let ctx = &mut self.ctx;

        if let Some(path) = ctx.conf.reset_count_path.clone() {
            ctx.counter = Some(ResetCounter::open(path).await?);
            ctx.cleanup.push(Cleanup::CloseCounter);
        }

        // Feasibility is checked before any worker runs.
        let affinity = AffinityController::new(ctx.conf.affinity.clone(), &ctx.pool.infos(), sink)?;

        ctx.pool.start_all().await?;
        ctx.cleanup.push(Cleanup::StopWorkers);

        ctx.affinity = Some(affinity.start()?);
        ctx.cleanup.push(Cleanup::StopAffinity);

        let strategy = match ctx.conf.mode {
            CoordinatorMode::Single => Strategy::Single(Single::setup(ctx).await?),
            CoordinatorMode::Grid => {
                let grid = Grid::setup(ctx).await?;
                ctx.cleanup.push(Cleanup::UngrabGrid);
                if let Some(show) = ctx.conf.grid.hiding {
                    let grid_conf = &ctx.conf.grid;
                    ctx.overlay.submit_batch(
                        (0..ctx.pool.len())
                            .map(|id| OverlayOp::SetVisible {
                                scene: grid_conf.grid_scene.clone(),
                                item: grid_conf.instance_item(id),
                                visible: true,
                            })
                            .collect(),
                    );
                    self.hider = Some(Hider::new(show));
                }
                Strategy::Grid(grid)
            }
        };
        self.strategy = Some(strategy);

        for key in ctx.global_keys() {
            ctx.window.grab_key(key)?;
        }
        ctx.cleanup.push(Cleanup::UngrabGlobal);
        Ok(())
    }

    async fn run(
        mut self,
        mut stop: mpsc::Receiver<oneshot::Sender<()>>,
        mut updates: mpsc::Receiver<Update>,
        mut errors: mpsc::Receiver<WorkerError>,
        mut input: BroadcastStream<InputEvent>,
    ) -> LoopResult {
        let result = loop {
            tokio::select! {
                ack = stop.recv() => {
                    self.cleanup().await;
                    if let Some(ack) = ack {
                        _ = ack.send(());
                    }
                    info!("coordinator stopped");
                    return Ok(());
                }
                Some(failure) = errors.recv() => {
                    if let Err(err) = self.ctx.pool.supervise(failure).await {
                        break Err(err);
                    }
                }
                Some(update) = updates.recv() => self.on_update(update),
                Some(id) = next_shown(self.hider.as_mut()),
                    if self.hider.as_ref().is_some_and(Hider::has_pending) => self.on_shown(id),
                event = input.next() => match event {
                    Some(Ok(event)) => self.on_input(event).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                        warn!(skipped = n, "input events lagged");
                    }
                    None => break Err(CoordinatorError::InputClosed),
                },
            }
        };

        if let Err(err) = &result {
            error!(error = %err, label = err.as_label(), "coordinator failed");
        }
        self.cleanup().await;
        result
    }

    fn on_update(&mut self, update: Update) {
        if let Some(affinity) = &self.ctx.affinity {
            affinity.update(&update);
        }
        let Some(state) = self.ctx.states.get_mut(update.id) else {
            return;
        };
        let prev = std::mem::replace(state, update.state);
        let Some(hider) = self.hider.as_mut() else {
            return;
        };
        if let Some(visible) = hider.observe(update.id, &prev, &self.ctx.states[update.id]) {
            self.set_cell_visible(update.id, visible);
        }
    }

    /// A delayed show is skipped when the instance went back to the dirt screen.
    fn on_shown(&self, id: InstanceId) {
        if self.ctx.states.get(id).is_some_and(|s| s.kind != StateKind::Dirt) {
            self.set_cell_visible(id, true);
        }
    }

    fn set_cell_visible(&self, id: InstanceId, visible: bool) {
        let grid = &self.ctx.conf.grid;
        self.ctx.overlay.submit(OverlayOp::SetVisible {
            scene: grid.grid_scene.clone(),
            item: grid.instance_item(id),
            visible,
        });
    }

    async fn on_input(&mut self, event: InputEvent) {
        let Some(strategy) = self.strategy.as_mut() else {
            return;
        };
        let ctx = &self.ctx;
        match event {
            InputEvent::Key {
                key,
                state: InputState::Down,
                time,
            } => {
                let keys = &ctx.conf.keys;
                if KeyConfig::matches(keys.focus, key) {
                    strategy.on_focus_key(ctx, time).await;
                } else if KeyConfig::matches(keys.reset, key) {
                    strategy.on_reset_key(ctx, time).await;
                } else if keys
                    .play_first_locked
                    .is_some_and(|binding| KeyConfig::matches(binding, key))
                {
                    strategy.on_play_first_locked(ctx, time).await;
                } else {
                    strategy.on_other(ctx, &event).await;
                }
            }
            InputEvent::Focus { window, .. } => debug!(window, "focus changed"),
            _ => strategy.on_other(ctx, &event).await,
        }
    }

    /// Runs the cleanup list newest first. The list is emptied, so a second
    /// call does nothing.
    async fn cleanup(&mut self) {
        let steps = std::mem::take(&mut self.ctx.cleanup);
        for step in steps.into_iter().rev() {
            match step {
                Cleanup::UngrabGlobal => {
                    for key in self.ctx.global_keys() {
                        if let Err(err) = self.ctx.window.ungrab_key(key) {
                            warn!(error = %err, "failed to ungrab global key");
                        }
                    }
                }
                Cleanup::UngrabGrid => {
                    if let Some(Strategy::Grid(grid)) = self.strategy.as_mut() {
                        grid.ungrab(&self.ctx);
                    }
                }
                Cleanup::StopAffinity => {
                    if let Some(affinity) = self.ctx.affinity.take() {
                        affinity.stop().await;
                    }
                }
                Cleanup::StopWorkers => self.ctx.pool.stop_all().await,
                Cleanup::CloseCounter => {
                    if let Some(counter) = self.ctx.counter.take()
                        && let Some(count) = counter.close().await
                    {
                        info!(count, "reset count saved");
                    }
                }
                Cleanup::ReleaseActive => drop(self.ctx.active.take()),
            }
            debug!(step = ?step, "cleanup step done");
        }
    }
}

async fn next_shown(hider: Option<&mut Hider>) -> Option<InstanceId> {
    hider?.next_due().await
}

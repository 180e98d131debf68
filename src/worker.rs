//! Per-instance worker.
//!
//! A worker owns one instance: its state reader, a watch on the state source
//! and every input sent to the instance's window. All public operations and
//! the loop's reactions to new readings go through one lock, so a reset racing
//! a focus is fully serialized.

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::{Mutex, OwnedMutexGuard, mpsc, oneshot},
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ActionError, ReaderError, WorkerError, WorkerFailure},
    instance::{InstanceId, InstanceInfo, InstanceState, StateKind, Update},
    reader::{ChangeKind, ReadKind, Reading, ReaderChoice, SourceWatcher, StateReader, open_reader},
    window::{CURRENT_TIME, Geometry, KEY_ESC, KEY_F3, Timestamp, WindowClient},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub reader: ReaderChoice,
    /// Wait before pausing an unfocused instance after it changes state.
    pub pause_delay: Duration,
    pub poll_interval: Duration,
    pub unpause_on_focus: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reader: ReaderChoice::Auto,
            pause_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(25),
            unpause_on_focus: true,
        }
    }
}

/// Applies the worker's state policies to a raw reading.
///
/// - `World` resolves to Ingame if already Ingame or focused, Idle otherwise.
/// - Ingame never drops straight to Idle.
/// - Idle while focused is promoted to Ingame.
pub fn resolve(prev: &InstanceState, reading: &Reading, focused: bool) -> InstanceState {
    let mut next = prev.clone();
    next.progress = reading.progress;
    next.menu = reading.menu;
    next.kind = match reading.kind {
        ReadKind::Menu => StateKind::Menu,
        ReadKind::Dirt => StateKind::Dirt,
        ReadKind::Preview => StateKind::Preview,
        ReadKind::World if prev.kind == StateKind::Ingame || focused => StateKind::Ingame,
        ReadKind::World => StateKind::Idle,
    };
    if prev.kind == StateKind::Ingame && next.kind == StateKind::Idle {
        next.kind = StateKind::Ingame;
    }
    if next.kind == StateKind::Idle && focused {
        next.kind = StateKind::Ingame;
    }

    match next.kind {
        StateKind::Preview => {
            if reading.spawn.is_some() {
                next.spawn = reading.spawn;
            }
            if prev.kind != StateKind::Preview {
                next.last_preview = Some(Utc::now());
            }
        }
        StateKind::Dirt | StateKind::Menu => next.spawn = None,
        StateKind::Idle | StateKind::Ingame => {}
    }
    next
}

#[derive(Debug, Default)]
struct Core {
    state: InstanceState,
    /// Bumped on every change of state kind and on stop; a scheduled pause
    /// only fires if this has not moved.
    generation: u64,
}

struct Shared {
    info: InstanceInfo,
    conf: WorkerConfig,
    window: Arc<dyn WindowClient>,
    core: Mutex<Core>,
    updates: mpsc::Sender<Update>,
}

type StopSender = oneshot::Sender<oneshot::Sender<()>>;

pub struct InstanceWorker {
    shared: Arc<Shared>,
    /// Held by the running loop.
    active: Arc<Mutex<()>>,
    stop: StdMutex<Option<StopSender>>,
}

impl InstanceWorker {
    pub fn new(
        info: InstanceInfo,
        conf: WorkerConfig,
        window: Arc<dyn WindowClient>,
        updates: mpsc::Sender<Update>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                info,
                conf,
                window,
                core: Mutex::new(Core::default()),
                updates,
            }),
            active: Arc::new(Mutex::new(())),
            stop: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.shared.info.id
    }

    pub fn info(&self) -> &InstanceInfo {
        &self.shared.info
    }

    pub fn is_running(&self) -> bool {
        self.active.try_lock().is_err()
    }

    pub async fn state(&self) -> InstanceState {
        self.shared.core.lock().await.state.clone()
    }

    /// Opens the state source, establishes the initial state and starts the
    /// processing loop. Failures after this point arrive on `errors`.
    pub async fn start(&self, errors: mpsc::Sender<WorkerError>) -> Result<(), WorkerFailure> {
        let guard = self
            .active
            .clone()
            .try_lock_owned()
            .map_err(|_| WorkerFailure::AlreadyRunning)?;

        let info = &self.shared.info;
        let (reader, reading) = open_reader(info, self.shared.conf.reader).await?;
        let watcher = SourceWatcher::spawn(reader.path().to_path_buf(), self.shared.conf.poll_interval)
            .await
            .map_err(ReaderError::Io)?;

        self.shared.establish(reading).await;

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.run(reader, watcher, stop_rx, errors, guard).await;
        });
        info!(instance = info.id, "worker started");
        Ok(())
    }

    /// Stops the loop and waits until it has released its resources. Stopping
    /// a worker that is not running returns immediately.
    pub async fn stop(&self) {
        let tx = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(tx) = tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(ack_tx).is_ok() {
            _ = ack_rx.await;
        }
    }

    /// Raises the instance's window. A paused ready instance is also unpaused
    /// and becomes Ingame.
    pub async fn focus(&self, time: Timestamp) -> Result<(), ActionError> {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;
        shared.window.focus_window(shared.info.window, time)?;
        if core.state.kind == StateKind::Idle {
            if shared.conf.unpause_on_focus {
                shared.window.key_press(shared.info.window, KEY_ESC, time);
            }
            core.state.kind = StateKind::Ingame;
            core.state.menu = false;
            core.generation += 1;
            shared.publish(&core.state);
        }
        Ok(())
    }

    /// Sends the reset key, or the leave-preview key from the preview screen.
    /// Refused while the world is generating. The instance enters Dirt here,
    /// so a background instance gets its pause scheduled here too.
    pub async fn reset(&self, time: Timestamp) -> Result<(), ActionError> {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;
        let key = match core.state.kind {
            StateKind::Dirt => {
                return Err(ActionError::IllegalState {
                    id: shared.info.id,
                    state: StateKind::Dirt,
                });
            }
            StateKind::Preview => shared.info.preview_key,
            _ => shared.info.reset_key,
        };
        shared.window.key_press(shared.info.window, key, time);

        core.state.kind = StateKind::Dirt;
        core.state.progress = 0;
        core.state.menu = false;
        core.state.spawn = None;
        core.state.last_reset = Some(Utc::now());
        core.generation += 1;
        shared.publish(&core.state);
        if !shared.is_focused() {
            shared.schedule_pause(core.generation);
        }
        Ok(())
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<(), ActionError> {
        let shared = &self.shared;
        let _core = shared.core.lock().await;
        shared
            .window
            .move_window(shared.info.window, Geometry::sized(width, height))?;
        Ok(())
    }
}

impl Shared {
    fn is_focused(&self) -> bool {
        match self.window.focused_window() {
            Ok(window) => window == self.info.window,
            Err(err) => {
                warn!(instance = self.info.id, error = %err, "failed to query focused window");
                false
            }
        }
    }

    fn publish(&self, state: &InstanceState) {
        let update = Update::new(self.info.id, state.clone());
        debug!(%update, "state changed");
        if let Err(err) = self.updates.try_send(update) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(instance = self.info.id, "update queue full, dropping update")
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    /// Initial state on start: the world signal is resolved but nothing is
    /// sent to the instance.
    async fn establish(&self, reading: Reading) {
        let focused = self.is_focused();
        let mut core = self.core.lock().await;
        let next = resolve(&core.state, &reading, focused);
        if next.kind != core.state.kind {
            core.generation += 1;
        }
        core.state = next;
        self.publish(&core.state);
    }

    async fn observe(self: &Arc<Self>, reading: Reading) {
        let focused = self.is_focused();
        let mut core = self.core.lock().await;
        let prev = core.state.clone();
        let next = resolve(&prev, &reading, focused);
        if next == prev {
            return;
        }

        let entered = next.kind != prev.kind;
        let paused = next.menu;
        core.state = next;
        if entered {
            core.generation += 1;
        }
        self.publish(&core.state);

        let background = matches!(
            core.state.kind,
            StateKind::Dirt | StateKind::Preview | StateKind::Idle
        );
        if entered && background && !focused && !paused {
            self.schedule_pause(core.generation);
        }
    }

    /// Pauses the instance after the configured delay unless its state has
    /// changed in the meantime.
    fn schedule_pause(self: &Arc<Self>, generation: u64) {
        let shared = self.clone();
        tokio::spawn(async move {
            sleep(shared.conf.pause_delay).await;
            let core = shared.core.lock().await;
            if core.generation != generation {
                debug!(instance = shared.info.id, "state moved on, skipping pause");
                return;
            }
            let window = shared.info.window;
            let time = shared.window.key_down(window, KEY_F3, CURRENT_TIME);
            let time = shared.window.key_press(window, KEY_ESC, time);
            shared.window.key_up(window, KEY_F3, time);
            debug!(instance = shared.info.id, state = %core.state.kind, "paused");
        });
    }

    async fn process(self: &Arc<Self>, reader: &mut dyn StateReader) -> Result<(), ReaderError> {
        match reader.process().await {
            Ok((reading, true)) => self.observe(reading).await,
            Ok((_, false)) => {}
            Err(err) if err.is_recoverable() => {
                warn!(instance = self.info.id, error = %err, "failed to read state source");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        mut reader: Box<dyn StateReader>,
        mut watcher: SourceWatcher,
        mut stop_rx: oneshot::Receiver<oneshot::Sender<()>>,
        errors: mpsc::Sender<WorkerError>,
        guard: OwnedMutexGuard<()>,
    ) {
        let id = self.info.id;
        let failure = loop {
            tokio::select! {
                ack = &mut stop_rx => {
                    watcher.stop();
                    drop(reader);
                    self.core.lock().await.generation += 1;
                    drop(guard);
                    if let Ok(ack) = ack {
                        _ = ack.send(());
                    }
                    info!(instance = id, "worker stopped");
                    return;
                }
                change = watcher.next() => {
                    let result = match change {
                        None => break WorkerFailure::WatcherClosed,
                        Some(Err(err)) => {
                            warn!(instance = id, error = %err, "state source watch error");
                            continue;
                        }
                        Some(Ok(ChangeKind::Modified)) => self.process(reader.as_mut()).await,
                        Some(Ok(change)) => match reader.process_event(change).await {
                            Ok(()) if change == ChangeKind::Created => self.process(reader.as_mut()).await,
                            other => other,
                        },
                    };
                    if let Err(err) = result {
                        break WorkerFailure::Reader(err);
                    }
                }
            }
        };

        // Release everything before reporting so the coordinator can restart
        // this worker as soon as it sees the error.
        drop(watcher);
        drop(reader);
        drop(stop_rx);
        self.core.lock().await.generation += 1;
        drop(guard);
        error!(instance = id, error = %failure, "worker failed");
        _ = errors
            .send(WorkerError {
                id,
                error: failure,
                fatal: true,
            })
            .await;
    }
}

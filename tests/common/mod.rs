#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    future::Future,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use resetguard::{
    InstanceInfo, Update,
    config::{Config, Delays},
    error::{DiscoveryError, OverlayError, WindowError},
    instance::{Discovery, LOG_FILE, STATUS_FILE},
    overlay::{Overlay, OverlayOp},
    window::{
        Geometry, InputEvent, InputState, KEY_F6, Key, KeyTimeline, Keycode, Timestamp, WindowClient,
        WindowId,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    time::{Instant, sleep, timeout},
};

pub const GRID_WINDOW: WindowId = 1;
pub const OTHER_WINDOW: WindowId = 2;
pub const GRID_TITLE: &str = "Projector (Scene) - Wall";
pub const RESET_KEY: Keycode = KEY_F6;
pub const PREVIEW_KEY: Keycode = 71;

pub fn instance_window(id: usize) -> WindowId {
    100 + id as WindowId
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOp {
    Key {
        window: WindowId,
        code: Keycode,
        state: InputState,
        time: Timestamp,
    },
    Focus(WindowId),
    Move(WindowId, Geometry),
    Grab(Key),
    Ungrab(Key),
    GrabPointer(WindowId),
    UngrabPointer,
}

/// Windowing client that records every request.
pub struct FakeWindow {
    titles: Mutex<BTreeMap<WindowId, String>>,
    focused: Mutex<WindowId>,
    ops: Mutex<Vec<WindowOp>>,
    events: broadcast::Sender<InputEvent>,
    timeline: KeyTimeline,
    clock: AtomicU32,
    refuse_focus: Mutex<Option<WindowId>>,
}

impl FakeWindow {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            titles: Mutex::new(BTreeMap::from([(OTHER_WINDOW, "Terminal".to_string())])),
            focused: Mutex::new(OTHER_WINDOW),
            ops: Mutex::new(Vec::new()),
            events,
            timeline: KeyTimeline::new(),
            clock: AtomicU32::new(1000),
            refuse_focus: Mutex::new(None),
        })
    }

    /// Registers the grid window and `count` instance windows.
    pub fn with_windows(count: usize, grid: bool) -> Arc<Self> {
        let window = Self::new();
        for id in 0..count {
            window.add_window(instance_window(id), &format!("Minecraft* - Instance {}", id + 1));
        }
        if grid {
            window.add_window(GRID_WINDOW, GRID_TITLE);
        }
        window
    }

    pub fn add_window(&self, window: WindowId, title: &str) {
        self.titles.lock().unwrap().insert(window, title.to_string());
    }

    pub fn set_focused(&self, window: WindowId) {
        *self.focused.lock().unwrap() = window;
    }

    pub fn focused(&self) -> WindowId {
        *self.focused.lock().unwrap()
    }

    /// Makes focus requests for `window` fail until cleared.
    pub fn refuse_focus(&self, window: Option<WindowId>) {
        *self.refuse_focus.lock().unwrap() = window;
    }

    /// Sizes `window` was moved to, in order.
    pub fn moves(&self, window: WindowId) -> Vec<Geometry> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                WindowOp::Move(w, geometry) if w == window => Some(geometry),
                _ => None,
            })
            .collect()
    }

    pub fn emit(&self, event: InputEvent) {
        self.events.send(event).unwrap();
    }

    pub fn press(&self, key: Key) {
        let time = self.current_time();
        self.emit(InputEvent::Key {
            key,
            state: InputState::Down,
            time,
        });
    }

    pub fn ops(&self) -> Vec<WindowOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Key codes pressed down in `window`, in order.
    pub fn keys_down(&self, window: WindowId) -> Vec<Keycode> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                WindowOp::Key {
                    window: w,
                    code,
                    state: InputState::Down,
                    ..
                } if w == window => Some(code),
                _ => None,
            })
            .collect()
    }

    pub fn grabbed(&self) -> Vec<Key> {
        let mut grabbed = Vec::new();
        for op in self.ops() {
            match op {
                WindowOp::Grab(key) => grabbed.push(key),
                WindowOp::Ungrab(key) => grabbed.retain(|k| *k != key),
                _ => {}
            }
        }
        grabbed
    }
}

impl WindowClient for FakeWindow {
    fn windows(&self) -> Result<Vec<WindowId>, WindowError> {
        Ok(self.titles.lock().unwrap().keys().copied().collect())
    }

    fn window_title(&self, window: WindowId) -> Result<String, WindowError> {
        self.titles
            .lock()
            .unwrap()
            .get(&window)
            .cloned()
            .ok_or(WindowError::NoSuchWindow(window))
    }

    fn geometry(&self, window: WindowId) -> Result<Geometry, WindowError> {
        if window == GRID_WINDOW {
            Ok(Geometry::sized(1200, 800))
        } else {
            Ok(Geometry::sized(1920, 1080))
        }
    }

    fn move_window(&self, window: WindowId, geometry: Geometry) -> Result<(), WindowError> {
        self.ops.lock().unwrap().push(WindowOp::Move(window, geometry));
        Ok(())
    }

    fn focused_window(&self) -> Result<WindowId, WindowError> {
        Ok(self.focused())
    }

    fn focus_window(&self, window: WindowId, _time: Timestamp) -> Result<(), WindowError> {
        if *self.refuse_focus.lock().unwrap() == Some(window) {
            return Err(WindowError::Request(format!("cannot focus {window}")));
        }
        self.set_focused(window);
        self.ops.lock().unwrap().push(WindowOp::Focus(window));
        Ok(())
    }

    fn grab_key(&self, key: Key) -> Result<(), WindowError> {
        self.ops.lock().unwrap().push(WindowOp::Grab(key));
        Ok(())
    }

    fn ungrab_key(&self, key: Key) -> Result<(), WindowError> {
        self.ops.lock().unwrap().push(WindowOp::Ungrab(key));
        Ok(())
    }

    fn grab_pointer(&self, window: WindowId) -> Result<(), WindowError> {
        self.ops.lock().unwrap().push(WindowOp::GrabPointer(window));
        Ok(())
    }

    fn ungrab_pointer(&self) -> Result<(), WindowError> {
        self.ops.lock().unwrap().push(WindowOp::UngrabPointer);
        Ok(())
    }

    fn send_raw_key(
        &self,
        window: WindowId,
        code: Keycode,
        state: InputState,
        time: Timestamp,
    ) -> Result<(), WindowError> {
        self.ops.lock().unwrap().push(WindowOp::Key {
            window,
            code,
            state,
            time,
        });
        Ok(())
    }

    fn current_time(&self) -> Timestamp {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(&self) -> broadcast::Receiver<InputEvent> {
        self.events.subscribe()
    }

    fn timeline(&self) -> &KeyTimeline {
        &self.timeline
    }
}

/// Overlay client that records every mutation.
#[derive(Default)]
pub struct FakeOverlay {
    ops: Mutex<Vec<OverlayOp>>,
    pub opened: AtomicUsize,
}

impl FakeOverlay {
    pub fn ops(&self) -> Vec<OverlayOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Visibility of `item` after every recorded operation.
    pub fn visible(&self, item: &str) -> Option<bool> {
        self.ops().into_iter().rev().find_map(|op| match op {
            OverlayOp::SetVisible {
                item: i, visible, ..
            } if i == item => Some(visible),
            _ => None,
        })
    }

    pub fn last_scene(&self) -> Option<String> {
        self.ops().into_iter().rev().find_map(|op| match op {
            OverlayOp::SetScene(scene) => Some(scene),
            _ => None,
        })
    }
}

#[async_trait]
impl Overlay for FakeOverlay {
    async fn set_scene(&self, scene: &str) -> Result<(), OverlayError> {
        self.ops.lock().unwrap().push(OverlayOp::SetScene(scene.to_string()));
        Ok(())
    }

    async fn set_visible(&self, scene: &str, item: &str, visible: bool) -> Result<(), OverlayError> {
        self.ops.lock().unwrap().push(OverlayOp::SetVisible {
            scene: scene.to_string(),
            item: item.to_string(),
            visible,
        });
        Ok(())
    }

    async fn set_text(&self, source: &str, text: &str) -> Result<(), OverlayError> {
        self.ops.lock().unwrap().push(OverlayOp::SetText {
            source: source.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn canvas_size(&self) -> Result<(u32, u32), OverlayError> {
        Ok((1200, 800))
    }

    async fn open_grid_window(&self, _scene: &str) -> Result<(), OverlayError> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// An instance directory on disk.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub info: InstanceInfo,
}

impl Fixture {
    /// Instance exposing the status file, initially holding `record`.
    pub fn status(id: usize, record: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATUS_FILE), record).unwrap();
        Self::build(id, dir, true)
    }

    /// Instance that can only be followed through its log.
    pub fn log(id: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join(LOG_FILE), "").unwrap();
        Self::build(id, dir, false)
    }

    fn build(id: usize, dir: tempfile::TempDir, status_output: bool) -> Self {
        let info = InstanceInfo {
            id,
            pid: 4000 + id as u32,
            window: instance_window(id),
            dir: dir.path().to_path_buf(),
            version: 16,
            status_output,
            reset_key: RESET_KEY,
            preview_key: PREVIEW_KEY,
        };
        Self { dir, info }
    }

    pub fn status_path(&self) -> std::path::PathBuf {
        self.dir.path().join(STATUS_FILE)
    }

    pub async fn write_status(&self, record: &str) {
        write_file(&self.status_path(), record).await;
    }

    pub fn log_path(&self) -> std::path::PathBuf {
        self.dir.path().join(LOG_FILE)
    }

    pub async fn append_log(&self, message: &str) {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.log_path())
            .await
            .unwrap();
        file.write_all(log_line(message).as_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }
}

pub fn log_line(message: &str) -> String {
    format!("[12:00:00] [Render thread/INFO]: {message}\n")
}

async fn write_file(path: &Path, contents: &str) {
    tokio::fs::write(path, contents).await.unwrap();
}

pub fn status_fixtures(count: usize, record: &str) -> Vec<Fixture> {
    (0..count).map(|id| Fixture::status(id, record)).collect()
}

pub fn infos(fixtures: &[Fixture]) -> Vec<InstanceInfo> {
    fixtures.iter().map(|f| f.info.clone()).collect()
}

/// Short delays so tests run fast.
pub fn fast_config() -> Config {
    Config {
        delays: Delays {
            pause: 10,
            reset: 5,
            reboot: 5,
            stretch: 0,
            poll: 5,
            spawn: 20,
        },
        ..Config::default()
    }
}

/// Discovery returning a fixed list and counting its calls.
pub struct StaticDiscovery {
    pub instances: Vec<InstanceInfo>,
    pub calls: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(instances: Vec<InstanceInfo>) -> Self {
        Self {
            instances,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<InstanceInfo>, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.instances.clone())
    }
}

/// Polls `check` until it holds, failing after a few seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Like [`eventually`] for async checks.
pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Receives updates until one matches.
pub async fn next_update<F: Fn(&Update) -> bool>(rx: &mut mpsc::Receiver<Update>, what: &str, matches: F) -> Update {
    timeout(Duration::from_secs(5), async {
        loop {
            let update = rx.recv().await.expect("update channel closed");
            if matches(&update) {
                return update;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

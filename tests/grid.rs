mod common;

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use common::*;
use resetguard::{
    Collaborators, Coordinator,
    affinity::NoAffinity,
    config::{Config, FIRST_CELL_KEYCODE, ShowMethod},
    error::CoordinatorError,
    hooks::INSTANCE_ENV,
    overlay::{Overlay, OverlayOp},
    window::{
        Geometry, InputEvent, InputState, KEY_ESC, Key, Keycode, Keymod, Point, WindowClient,
    },
};
use tokio::time::{sleep, timeout};

struct Grid {
    window: Arc<FakeWindow>,
    overlay: Arc<FakeOverlay>,
    coordinator: Coordinator,
    fixtures: Vec<Fixture>,
}

async fn start_grid(count: usize, record: &str, conf: Config) -> Grid {
    let window = FakeWindow::with_windows(count, true);
    let overlay = Arc::new(FakeOverlay::default());
    let fixtures = status_fixtures(count, record);
    let coordinator = Coordinator::new(
        Arc::new(conf),
        Collaborators {
            window: window.clone() as Arc<dyn WindowClient>,
            overlay: Some(overlay.clone() as Arc<dyn Overlay>),
            affinity: Arc::new(NoAffinity),
        },
    );
    coordinator.start(infos(&fixtures)).await.unwrap();
    // Let the initial states reach the loop.
    sleep(Duration::from_millis(50)).await;
    Grid {
        window,
        overlay,
        coordinator,
        fixtures,
    }
}

fn cell(id: usize, modifiers: Keymod) -> Key {
    Key::with_modifiers(FIRST_CELL_KEYCODE + id as Keycode, modifiers)
}

fn lock_ops(overlay: &FakeOverlay, item: &str) -> usize {
    overlay
        .ops()
        .iter()
        .filter(|op| matches!(op, OverlayOp::SetVisible { item: i, .. } if i == item))
        .count()
}

#[tokio::test]
async fn test_startup_hides_locks_and_grabs_keys() {
    let grid = start_grid(3, "inworld,paused", fast_config()).await;
    let conf = Config::default();

    let overlay = grid.overlay.clone();
    eventually("lock indicators hidden", || {
        (1..=3).all(|n| overlay.visible(&format!("Lock {n}")) == Some(false))
    })
    .await;
    assert_eq!(grid.overlay.last_scene().as_deref(), Some("Wall"));
    assert_eq!(grid.window.focused(), GRID_WINDOW);

    let grabbed = grid.window.grabbed();
    assert!(grabbed.contains(&conf.keys.focus));
    assert!(grabbed.contains(&conf.keys.reset));
    assert_eq!(grabbed.len(), 2 + 3 * 4);

    grid.coordinator.stop().await;
    assert!(grid.window.grabbed().is_empty());
    assert!(!grid.coordinator.is_running());
    grid.coordinator.wait().await.unwrap();
}

#[tokio::test]
async fn test_reset_skips_locked_instances() {
    let grid = start_grid(5, "inworld,paused", fast_config()).await;
    let conf = Config::default();

    grid.window.press(cell(1, conf.keys.cell_lock));
    grid.window.press(cell(3, conf.keys.cell_lock));
    let overlay = grid.overlay.clone();
    eventually("locks shown", || {
        overlay.visible("Lock 2") == Some(true) && overlay.visible("Lock 4") == Some(true)
    })
    .await;

    grid.window.press(conf.keys.reset);
    let window = grid.window.clone();
    eventually("unlocked instances reset", || {
        [0, 2, 4]
            .iter()
            .all(|&id| window.keys_down(instance_window(id)).contains(&RESET_KEY))
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    for id in [1, 3] {
        assert!(grid.window.keys_down(instance_window(id)).is_empty());
    }

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_lock_toggles_with_each_press() {
    let grid = start_grid(3, "inworld,paused", fast_config()).await;
    let lock = cell(2, Config::default().keys.cell_lock);

    for presses in 1..=5usize {
        grid.window.press(lock);
        let overlay = grid.overlay.clone();
        // One hide at startup plus one per press.
        eventually("lock indicator update", || lock_ops(&overlay, "Lock 3") == 1 + presses).await;
        assert_eq!(grid.overlay.visible("Lock 3"), Some(presses % 2 == 1));
    }

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_play_and_return_to_grid() {
    let grid = start_grid(2, "inworld,paused", fast_config()).await;
    let conf = Config::default();

    grid.window.press(cell(0, conf.keys.cell_play));
    let window = grid.window.clone();
    eventually("instance focused", || window.focused() == instance_window(0)).await;
    assert_eq!(grid.window.keys_down(instance_window(0)), vec![KEY_ESC]);
    let overlay = grid.overlay.clone();
    eventually("instance scene", || overlay.last_scene().as_deref() == Some("Instance 1")).await;
    // Cell keys are released while playing.
    assert_eq!(grid.window.grabbed().len(), 2);

    grid.window.press(conf.keys.reset);
    eventually("back on grid", || window.focused() == GRID_WINDOW).await;
    assert!(grid.window.keys_down(instance_window(0)).contains(&RESET_KEY));
    assert!(grid.window.keys_down(instance_window(1)).is_empty());
    eventually("grid scene", || overlay.last_scene().as_deref() == Some("Wall")).await;
    assert_eq!(grid.window.grabbed().len(), 2 + 2 * 4);

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_play_ignores_generating_instance() {
    let grid = start_grid(2, "generating,40", fast_config()).await;

    grid.window.press(cell(1, Config::default().keys.cell_play));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(grid.window.focused(), GRID_WINDOW);
    assert!(grid.window.keys_down(instance_window(1)).is_empty());

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_pointer_drag_locks_each_cell_once() {
    let mut conf = fast_config();
    conf.grid.use_pointer = true;
    let grid = start_grid(5, "inworld,paused", conf).await;
    assert!(grid.window.ops().contains(&WindowOp::GrabPointer(GRID_WINDOW)));

    // 5 instances on 1200x800: 3 columns, 2 rows of 400x400 cells.
    let lock = Config::default().keys.cell_lock;
    let time = grid.window.current_time();
    grid.window.emit(InputEvent::Button {
        button: 1,
        modifiers: lock,
        state: InputState::Down,
        point: Point { x: 450, y: 100 },
        window: GRID_WINDOW,
        time,
    });
    for x in [500, 700, 850] {
        grid.window.emit(InputEvent::Motion {
            modifiers: lock | Keymod::BUTTON1,
            point: Point { x, y: 100 },
            window: GRID_WINDOW,
            time,
        });
    }
    grid.window.emit(InputEvent::Button {
        button: 1,
        modifiers: lock | Keymod::BUTTON1,
        state: InputState::Up,
        point: Point { x: 850, y: 100 },
        window: GRID_WINDOW,
        time,
    });

    let overlay = grid.overlay.clone();
    eventually("cells locked", || {
        overlay.visible("Lock 2") == Some(true) && overlay.visible("Lock 3") == Some(true)
    })
    .await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(lock_ops(&grid.overlay, "Lock 2"), 2);
    assert_eq!(lock_ops(&grid.overlay, "Lock 3"), 2);
    assert_eq!(grid.overlay.visible("Lock 1"), Some(false));

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_second_failure_of_a_worker_is_fatal() {
    let mut conf = fast_config();
    conf.delays.reboot = 300;
    let grid = start_grid(2, "title", conf).await;
    let fixture = &grid.fixtures[1];

    tokio::fs::remove_file(fixture.status_path()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    fixture.write_status("title").await;

    // The reboot lands once the delay has passed; the coordinator keeps going.
    sleep(Duration::from_millis(600)).await;
    assert!(grid.coordinator.is_running());

    tokio::fs::remove_file(fixture.status_path()).await.unwrap();
    let result = timeout(Duration::from_secs(5), grid.coordinator.wait())
        .await
        .expect("coordinator did not stop");
    assert!(matches!(result, Err(CoordinatorError::RebootExhausted { id: 1 })));
    assert!(!grid.coordinator.is_running());
    assert!(grid.window.grabbed().is_empty());
}

#[tokio::test]
async fn test_failed_reboot_is_fatal() {
    let grid = start_grid(2, "title", fast_config()).await;

    // Without its status file the instance falls back to a log it never had.
    tokio::fs::remove_file(grid.fixtures[0].status_path()).await.unwrap();
    let result = timeout(Duration::from_secs(5), grid.coordinator.wait())
        .await
        .expect("coordinator did not stop");
    assert!(matches!(result, Err(CoordinatorError::RebootFailed { id: 0, .. })));
}

#[tokio::test]
async fn test_missing_grid_window() {
    let window = FakeWindow::with_windows(2, false);
    let overlay = Arc::new(FakeOverlay::default());
    let fixtures = status_fixtures(2, "title");
    let coordinator = Coordinator::new(
        Arc::new(fast_config()),
        Collaborators {
            window: window.clone(),
            overlay: Some(overlay.clone()),
            affinity: Arc::new(NoAffinity),
        },
    );

    let err = coordinator.start(infos(&fixtures)).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::GridWindowMissing { .. }));
    assert_eq!(overlay.opened.load(Ordering::Relaxed), 1);
    assert!(!coordinator.is_running());
    assert!(window.grabbed().is_empty());

    // Everything was released, so a later start can succeed.
    window.add_window(GRID_WINDOW, GRID_TITLE);
    coordinator.start(infos(&fixtures)).await.unwrap();
    assert!(matches!(
        coordinator.start(infos(&fixtures)).await,
        Err(CoordinatorError::AlreadyRunning)
    ));
    coordinator.stop().await;
}

#[tokio::test]
async fn test_no_instances() {
    let coordinator = Coordinator::new(
        Arc::new(fast_config()),
        Collaborators {
            window: FakeWindow::new(),
            overlay: None,
            affinity: Arc::new(NoAffinity),
        },
    );
    assert!(matches!(
        coordinator.start(Vec::new()).await,
        Err(CoordinatorError::NoInstances)
    ));
}

#[tokio::test]
async fn test_reset_others_needs_a_ready_instance() {
    let grid = start_grid(3, "inworld,paused", fast_config()).await;
    let keys = Config::default().keys;
    grid.fixtures[1].write_status("generating,40").await;
    sleep(Duration::from_millis(50)).await;

    grid.window.press(cell(1, keys.cell_reset_others));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(grid.window.focused(), GRID_WINDOW);
    for id in 0..3 {
        assert!(!grid.window.keys_down(instance_window(id)).contains(&RESET_KEY));
    }

    grid.window.press(cell(0, keys.cell_reset_others));
    let window = grid.window.clone();
    eventually("target played", || window.focused() == instance_window(0)).await;
    eventually("other ready instance reset", || {
        window.keys_down(instance_window(2)).contains(&RESET_KEY)
    })
    .await;
    assert!(!grid.window.keys_down(instance_window(0)).contains(&RESET_KEY));
    // Still generating, so its reset is refused.
    assert!(!grid.window.keys_down(instance_window(1)).contains(&RESET_KEY));

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_reset_moves_on_to_locked_instance() {
    let mut conf = fast_config();
    conf.grid.auto_play_locked = true;
    let grid = start_grid(2, "inworld,paused", conf).await;
    let keys = Config::default().keys;

    grid.window.press(cell(1, keys.cell_lock));
    let overlay = grid.overlay.clone();
    eventually("lock shown", || overlay.visible("Lock 2") == Some(true)).await;
    grid.window.press(cell(0, keys.cell_play));
    let window = grid.window.clone();
    eventually("first instance played", || window.focused() == instance_window(0)).await;

    grid.window.press(keys.reset);
    eventually("locked instance played", || window.focused() == instance_window(1)).await;
    assert!(grid.window.keys_down(instance_window(0)).contains(&RESET_KEY));
    eventually("locked instance unlocked", || overlay.visible("Lock 2") == Some(false)).await;
    eventually("scene follows", || overlay.last_scene().as_deref() == Some("Instance 2")).await;

    // Nothing locked is left, so the next reset goes back to the grid.
    grid.window.press(keys.reset);
    eventually("back on grid", || window.focused() == GRID_WINDOW).await;

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_stretch_windows() {
    let mut conf = fast_config();
    conf.grid.stretch_windows = true;
    let thin = conf.grid.stretch_size;
    let thin = Geometry::sized(thin.width, thin.height);
    let grid = start_grid(2, "inworld,paused", conf).await;
    let keys = Config::default().keys;

    assert_eq!(grid.window.moves(instance_window(0)), vec![thin]);
    assert_eq!(grid.window.moves(instance_window(1)), vec![thin]);

    grid.window.press(cell(0, keys.cell_play));
    let window = grid.window.clone();
    eventually("played instance stretched", || window.moves(instance_window(0)).len() == 2).await;
    assert_eq!(grid.window.moves(instance_window(0))[1], Geometry::sized(1200, 800));

    grid.window.press(keys.reset);
    eventually("reset instance shrunk", || window.moves(instance_window(0)).len() == 3).await;
    assert_eq!(grid.window.moves(instance_window(0))[2], thin);
    assert_eq!(grid.window.moves(instance_window(1)), vec![thin]);

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_hooks_receive_instance_id() {
    let dir = tempfile::tempdir().unwrap();
    let played = dir.path().join("played");
    let reset = dir.path().join("reset");
    let mut conf = fast_config();
    conf.hooks.play = Some(format!("echo \"${INSTANCE_ENV}\" >> '{}'", played.display()));
    conf.hooks.reset = Some(format!("echo \"${INSTANCE_ENV}\" >> '{}'", reset.display()));
    let grid = start_grid(2, "inworld,paused", conf).await;
    let keys = Config::default().keys;

    grid.window.press(cell(1, keys.cell_play));
    eventually("play hook ran", || {
        std::fs::read_to_string(&played).unwrap_or_default() == "1\n"
    })
    .await;

    grid.window.press(keys.reset);
    eventually("reset hook ran", || {
        std::fs::read_to_string(&reset).unwrap_or_default() == "1\n"
    })
    .await;

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_failed_focus_keeps_the_grid() {
    let grid = start_grid(2, "inworld,paused", fast_config()).await;
    let keys = Config::default().keys;

    grid.window.press(cell(0, keys.cell_lock));
    let overlay = grid.overlay.clone();
    eventually("lock shown", || overlay.visible("Lock 1") == Some(true)).await;

    grid.window.refuse_focus(Some(instance_window(0)));
    grid.window.press(cell(0, keys.cell_play));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(grid.window.focused(), GRID_WINDOW);
    assert_eq!(grid.window.grabbed().len(), 2 + 2 * 4);
    assert_eq!(grid.overlay.last_scene().as_deref(), Some("Wall"));
    assert_eq!(grid.overlay.visible("Lock 1"), Some(true));

    // Cell keys still work once the window accepts focus.
    grid.window.refuse_focus(None);
    grid.window.press(cell(0, keys.cell_play));
    let window = grid.window.clone();
    eventually("instance played", || window.focused() == instance_window(0)).await;
    assert_eq!(grid.window.grabbed().len(), 2);

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_play_first_locked_key() {
    let mut conf = fast_config();
    let first_locked = Key::new(41);
    conf.keys.play_first_locked = Some(first_locked);
    let grid = start_grid(3, "inworld,paused", conf).await;
    let keys = Config::default().keys;
    assert!(grid.window.grabbed().contains(&first_locked));
    assert_eq!(grid.window.grabbed().len(), 3 + 3 * 4);

    // Nothing locked yet.
    grid.window.press(first_locked);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(grid.window.focused(), GRID_WINDOW);

    grid.window.press(cell(2, keys.cell_lock));
    let overlay = grid.overlay.clone();
    eventually("lock shown", || overlay.visible("Lock 3") == Some(true)).await;
    grid.window.press(first_locked);
    let window = grid.window.clone();
    eventually("locked instance played", || window.focused() == instance_window(2)).await;

    grid.coordinator.stop().await;
    assert!(grid.window.grabbed().is_empty());
}

#[tokio::test]
async fn test_dirt_cells_are_hidden() {
    let mut conf = fast_config();
    conf.grid.hiding = Some(ShowMethod::Delay { ms: 20 });
    let grid = start_grid(2, "inworld,paused", conf).await;

    let overlay = grid.overlay.clone();
    eventually("cells shown at startup", || {
        overlay.visible("Wall MC 1") == Some(true) && overlay.visible("Wall MC 2") == Some(true)
    })
    .await;

    grid.window.press(Config::default().keys.reset);
    eventually("reset cells hidden", || {
        overlay.visible("Wall MC 1") == Some(false) && overlay.visible("Wall MC 2") == Some(false)
    })
    .await;

    grid.fixtures[0].write_status("previewing,40").await;
    eventually("previewing cell shown", || overlay.visible("Wall MC 1") == Some(true)).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(grid.overlay.visible("Wall MC 2"), Some(false));

    grid.coordinator.stop().await;
}

#[tokio::test]
async fn test_reset_count_and_sleepbg_lock() {
    let dir = tempfile::tempdir().unwrap();
    let count = dir.path().join("resets.txt");
    let lock = dir.path().join("sleepbg.lock");
    let mut conf = fast_config();
    conf.reset_count_path = Some(count.clone());
    conf.sleepbg_lock = Some(lock.clone());
    let grid = start_grid(3, "inworld,paused", conf).await;
    let keys = Config::default().keys;

    grid.window.press(cell(0, keys.cell_play));
    eventually("sleepbg lock created", || lock.exists()).await;

    grid.window.press(keys.reset);
    let window = grid.window.clone();
    eventually("back on grid", || window.focused() == GRID_WINDOW).await;
    eventually("sleepbg lock removed", || !lock.exists()).await;

    // Instance 0 is still on the dirt screen and refuses.
    grid.window.press(keys.reset);
    eventually("others reset", || {
        [1, 2]
            .iter()
            .all(|&id| window.keys_down(instance_window(id)).contains(&RESET_KEY))
    })
    .await;

    grid.coordinator.stop().await;
    assert_eq!(std::fs::read_to_string(&count).unwrap(), "3");
}

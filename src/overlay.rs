//! Streaming overlay collaborator and the fire-and-forget sink in front of it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::OverlayError;

const SINK_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayOp {
    SetScene(String),
    SetVisible {
        scene: String,
        item: String,
        visible: bool,
    },
    SetText {
        source: String,
        text: String,
    },
}

#[async_trait]
pub trait Overlay: Send + Sync {
    async fn set_scene(&self, scene: &str) -> Result<(), OverlayError>;

    async fn set_visible(&self, scene: &str, item: &str, visible: bool)
    -> Result<(), OverlayError>;

    async fn set_text(&self, source: &str, text: &str) -> Result<(), OverlayError>;

    async fn canvas_size(&self) -> Result<(u32, u32), OverlayError>;

    /// Opens a window showing `scene`, used as the grid window.
    async fn open_grid_window(&self, scene: &str) -> Result<(), OverlayError>;

    /// Applies several mutations. Implementations able to send them in one
    /// request should override this.
    async fn batch(&self, ops: Vec<OverlayOp>) -> Result<(), OverlayError> {
        for op in ops {
            apply(self, op).await?;
        }
        Ok(())
    }
}

async fn apply<O: Overlay + ?Sized>(overlay: &O, op: OverlayOp) -> Result<(), OverlayError> {
    match op {
        OverlayOp::SetScene(scene) => overlay.set_scene(&scene).await,
        OverlayOp::SetVisible {
            scene,
            item,
            visible,
        } => overlay.set_visible(&scene, &item, visible).await,
        OverlayOp::SetText { source, text } => overlay.set_text(&source, &text).await,
    }
}

enum Job {
    Single(OverlayOp),
    Batch(Vec<OverlayOp>),
    Flush(oneshot::Sender<()>),
}

/// Ordered, non-blocking front for an optional [`Overlay`].
///
/// Submitted operations run on one background task in submission order, so a
/// lock indicator can never be shown after a later hide. Errors are logged and
/// never reach the submitter. Without an overlay every call is a no-op.
#[derive(Clone, Default)]
pub struct OverlaySink {
    inner: Option<SinkInner>,
}

#[derive(Clone)]
struct SinkInner {
    overlay: Arc<dyn Overlay>,
    tx: mpsc::Sender<Job>,
}

impl OverlaySink {
    /// Must be called inside a tokio runtime when `overlay` is set.
    pub fn new(overlay: Option<Arc<dyn Overlay>>) -> Self {
        let Some(overlay) = overlay else {
            return Self { inner: None };
        };
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        tokio::spawn(drive(overlay.clone(), rx));
        Self {
            inner: Some(SinkInner { overlay, tx }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn submit(&self, op: OverlayOp) {
        self.push(Job::Single(op));
    }

    pub fn submit_batch(&self, ops: Vec<OverlayOp>) {
        if ops.is_empty() {
            return;
        }
        self.push(Job::Batch(ops));
    }

    pub fn set_scene<S: Into<String>>(&self, scene: S) {
        self.submit(OverlayOp::SetScene(scene.into()));
    }

    fn push(&self, job: Job) {
        let Some(inner) = &self.inner else {
            return;
        };
        if let Err(err) = inner.tx.try_send(job) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("overlay queue full, dropping operation")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("overlay task gone, dropping operation")
                }
            }
        }
    }

    /// Waits until everything submitted so far has been applied.
    pub async fn flush(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if inner.tx.send(Job::Flush(done_tx)).await.is_ok() {
            _ = done_rx.await;
        }
    }

    /// Queried directly since the caller needs the answer.
    pub async fn canvas_size(&self) -> Option<Result<(u32, u32), OverlayError>> {
        match &self.inner {
            Some(inner) => Some(inner.overlay.canvas_size().await),
            None => None,
        }
    }

    pub async fn open_grid_window(&self, scene: &str) -> Option<Result<(), OverlayError>> {
        match &self.inner {
            Some(inner) => Some(inner.overlay.open_grid_window(scene).await),
            None => None,
        }
    }
}

async fn drive(overlay: Arc<dyn Overlay>, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let result = match job {
            Job::Single(op) => {
                debug!(?op, "overlay");
                apply(overlay.as_ref(), op).await
            }
            Job::Batch(ops) => {
                debug!(count = ops.len(), "overlay batch");
                overlay.batch(ops).await
            }
            Job::Flush(done) => {
                _ = done.send(());
                continue;
            }
        };
        if let Err(err) = result {
            error!(error = %err, "overlay request failed");
        }
    }
}

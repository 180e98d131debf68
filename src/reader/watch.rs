use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ChangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

async fn fingerprint(path: &Path) -> io::Result<Option<Fingerprint>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(Fingerprint {
            len: meta.len(),
            modified: meta.modified().ok(),
            inode: inode(&meta),
        })),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

fn diff(prev: Option<Fingerprint>, next: Option<Fingerprint>) -> Vec<ChangeKind> {
    match (prev, next) {
        (None, None) => vec![],
        (Some(_), None) => vec![ChangeKind::Removed],
        (None, Some(_)) => vec![ChangeKind::Created],
        (Some(a), Some(b)) if a.inode != b.inode => vec![ChangeKind::Removed, ChangeKind::Created],
        (Some(a), Some(b)) if a != b => vec![ChangeKind::Modified],
        _ => vec![],
    }
}

/// Polls one state source and reports how it changed.
///
/// The channel closes when the watcher is dropped or the receiver goes away.
/// Metadata errors other than a missing file are forwarded and polling goes on.
#[derive(Debug)]
pub struct SourceWatcher {
    rx: mpsc::Receiver<io::Result<ChangeKind>>,
    cancel: CancellationToken,
}

impl SourceWatcher {
    pub async fn spawn(path: PathBuf, every: Duration) -> io::Result<Self> {
        let initial = fingerprint(&path).await?;
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(poll(path, every, initial, tx, cancel.clone()));
        Ok(Self { rx, cancel })
    }

    /// `None` once the watcher has stopped.
    pub async fn next(&mut self) -> Option<io::Result<ChangeKind>> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll(
    path: PathBuf,
    every: Duration,
    mut last: Option<Fingerprint>,
    tx: mpsc::Sender<io::Result<ChangeKind>>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let changes = match fingerprint(&path).await {
                    Ok(next) => {
                        let changes = diff(last, next);
                        last = next;
                        changes.into_iter().map(Ok).collect()
                    }
                    Err(err) => vec![Err(err)],
                };
                for change in changes {
                    trace!(path = %path.display(), ?change, "source changed");
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

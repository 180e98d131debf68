//! Running reset count kept in a file.

use std::{io, io::SeekFrom, path::PathBuf};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::error::CounterError;

const COUNTER_CAPACITY: usize = 256;

/// Counts resets on a background task so the coordinator never waits on disk.
pub struct ResetCounter {
    tx: mpsc::Sender<()>,
    task: JoinHandle<u64>,
}

impl ResetCounter {
    /// Opens or creates the count file and continues from the number in it.
    pub async fn open(path: PathBuf) -> Result<Self, CounterError> {
        let open_err = |source| CounterError::Open {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(open_err)?;
        let mut raw = String::new();
        file.read_to_string(&mut raw).await.map_err(open_err)?;

        let raw = raw.trim();
        let count = if raw.is_empty() {
            0
        } else {
            raw.parse::<u64>().map_err(|_| CounterError::Parse {
                path: path.clone(),
                raw: raw.to_string(),
            })?
        };

        info!(path = %path.display(), count, "reset counter opened");
        let (tx, rx) = mpsc::channel(COUNTER_CAPACITY);
        let task = tokio::spawn(drive(file, path, count, rx));
        Ok(Self { tx, task })
    }

    pub fn increment(&self) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(()) {
            warn!("reset counter queue full, dropping a reset");
        }
    }

    /// Writes out every queued increment and returns the final count.
    pub async fn close(self) -> Option<u64> {
        let Self { tx, task } = self;
        drop(tx);
        match task.await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "reset counter task failed");
                None
            }
        }
    }
}

async fn drive(mut file: File, path: PathBuf, mut count: u64, mut rx: mpsc::Receiver<()>) -> u64 {
    while rx.recv().await.is_some() {
        count += 1;
        // One write for a burst of resets.
        while rx.try_recv().is_ok() {
            count += 1;
        }
        match write_count(&mut file, count).await {
            Ok(()) => debug!(count, "reset count written"),
            Err(err) => warn!(path = %path.display(), count, error = %err, "failed to write reset count"),
        }
    }
    count
}

async fn write_count(file: &mut File, count: u64) -> io::Result<()> {
    let text = count.to_string();
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(text.as_bytes()).await?;
    file.set_len(text.len() as u64).await?;
    file.flush().await
}

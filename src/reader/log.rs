use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{error::ReaderError, instance::Position};

use super::{ChangeKind, ReadKind, Reading, StateReader};

const RANDOM_SEED: &str = "Resetting a random seed";
const SET_SEED: &str = "Resetting the set seed";
const PREVIEW: &str = "Starting Preview at";
const PROGRESS: &str = "Preparing spawn area";
const LOADED: &str = "Loaded 0 advancements";
const CHAT: &str = "CHAT";

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_START: Duration = Duration::from_millis(1);

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Preparing spawn area:\s*(\d+)%").expect("valid regex"));

static PREVIEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Starting Preview at \(\s*(-?[\d.]+),\s*(-?[\d.]+),\s*(-?[\d.]+)\s*\)")
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq)]
enum LogEvent {
    Dirt,
    Preview(Option<Position>),
    Progress(u8),
    World,
}

fn classify(line: &str) -> Option<LogEvent> {
    if line.contains(CHAT) {
        return None;
    }
    if line.contains(RANDOM_SEED) || line.contains(SET_SEED) {
        Some(LogEvent::Dirt)
    } else if line.contains(PREVIEW) {
        let spawn = parse_position(line);
        if spawn.is_none() {
            warn!(line = line.trim_end(), "unparsable preview position");
        }
        Some(LogEvent::Preview(spawn))
    } else if line.contains(PROGRESS) {
        let progress = PROGRESS_RE
            .captures(line)
            .and_then(|c| c[1].parse::<u32>().ok())
            .map(|p| p.min(100) as u8);
        if progress.is_none() {
            debug!(line = line.trim_end(), "unparsable progress line");
        }
        progress.map(LogEvent::Progress)
    } else if line.contains(LOADED) {
        Some(LogEvent::World)
    } else {
        None
    }
}

fn parse_position(line: &str) -> Option<Position> {
    let caps = PREVIEW_RE.captures(line)?;
    Some(Position {
        x: caps[1].parse().ok()?,
        y: caps[2].parse().ok()?,
        z: caps[3].parse().ok()?,
    })
}

/// Tails the game log. Unrecognized lines are ignored.
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    /// Bytes of a line whose end has not been written yet.
    pending: Vec<u8>,
    reading: Reading,
}

impl LogReader {
    pub async fn open(path: PathBuf) -> Result<(Self, Reading), ReaderError> {
        let file = File::open(&path)
            .await
            .map_err(|source| ReaderError::Open {
                path: path.clone(),
                source,
            })?;
        let mut reader = Self {
            path,
            reader: Some(BufReader::new(file)),
            pending: Vec::new(),
            reading: Reading::default(),
        };
        let (reading, _) = reader.process().await?;
        Ok((reader, reading))
    }

    /// Reads the next complete line. A line cut off mid-write is retried with
    /// exponential backoff, then left in `pending` for the next call.
    async fn read_line(&mut self) -> Result<Option<String>, ReaderError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        if reader.read_until(b'\n', &mut self.pending).await? == 0 {
            return Ok(None);
        }

        let mut backoff = RETRY_START;
        let mut attempt = 0;
        while !self.pending.ends_with(b"\n") {
            if attempt == RETRY_ATTEMPTS {
                debug!(path = %self.path.display(), "deferring incomplete line");
                return Ok(None);
            }
            sleep(backoff).await;
            backoff *= 2;
            attempt += 1;
            reader.read_until(b'\n', &mut self.pending).await?;
        }
        if attempt > 0 {
            debug!(attempt, "completed torn line");
        }

        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Ok(Some(line))
    }

    fn apply(&mut self, event: LogEvent) {
        match event {
            LogEvent::Dirt => {
                self.reading.kind = ReadKind::Dirt;
                self.reading.progress = 0;
                self.reading.spawn = None;
            }
            LogEvent::Preview(spawn) => {
                self.reading.kind = ReadKind::Preview;
                self.reading.spawn = spawn;
            }
            LogEvent::Progress(progress) => self.reading.progress = progress,
            LogEvent::World => self.reading.kind = ReadKind::World,
        }
    }
}

#[async_trait]
impl StateReader for LogReader {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn process(&mut self) -> Result<(Reading, bool), ReaderError> {
        let mut updated = false;
        while let Some(line) = self.read_line().await? {
            if let Some(event) = classify(&line) {
                self.apply(event);
                updated = true;
            }
        }
        Ok((self.reading.clone(), updated))
    }

    async fn process_event(&mut self, change: ChangeKind) -> Result<(), ReaderError> {
        match change {
            ChangeKind::Removed => {
                if self.reader.take().is_some() {
                    info!(path = %self.path.display(), "log removed, waiting for it to return");
                }
                self.pending.clear();
            }
            ChangeKind::Created => {
                let file =
                    File::open(&self.path)
                        .await
                        .map_err(|source| ReaderError::Open {
                            path: self.path.clone(),
                            source,
                        })?;
                self.reader = Some(BufReader::new(file));
                self.pending.clear();
                info!(path = %self.path.display(), "log reopened");
            }
            ChangeKind::Modified => {}
        }
        Ok(())
    }
}

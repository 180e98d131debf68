use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

use tracing::warn;

use crate::error::ReaderError;

use super::{ChangeKind, ReadKind, Reading, StateReader};

/// Upper bound on a status record; the file is rewritten in place and never
/// grows past this.
pub const MAX_RECORD: usize = 32;

/// Parses one `token[,arg]` record on top of the previous reading.
pub fn parse_record(raw: &str, prev: &Reading) -> Result<Reading, ReaderError> {
    let raw = raw.trim();
    let (token, arg) = match raw.split_once(',') {
        Some((token, arg)) => (token, Some(arg)),
        None => (raw, None),
    };

    let mut next = prev.clone();
    match token {
        "title" => {
            next.kind = ReadKind::Menu;
            next.progress = 0;
            next.menu = false;
            next.spawn = None;
        }
        "waiting" => {
            next.kind = ReadKind::Dirt;
            next.progress = 0;
            next.menu = false;
        }
        "generating" => {
            next.kind = ReadKind::Dirt;
            next.progress = progress("generating", arg)?;
            next.menu = false;
        }
        "previewing" => {
            next.kind = ReadKind::Preview;
            next.progress = progress("previewing", arg)?;
            next.menu = false;
        }
        "inworld" => {
            let flag = arg.ok_or(ReaderError::MissingArgument { token: "inworld" })?;
            next.kind = ReadKind::World;
            next.menu = flag != "unpaused";
        }
        other => return Err(ReaderError::UnknownToken(other.to_string())),
    }
    Ok(next)
}

fn progress(token: &'static str, arg: Option<&str>) -> Result<u8, ReaderError> {
    let arg = arg.ok_or(ReaderError::MissingArgument { token })?;
    arg.parse::<u32>()
        .map(|p| p.min(100) as u8)
        .map_err(|_| ReaderError::InvalidArgument {
            token,
            arg: arg.to_string(),
        })
}

/// Reads the single-record status file written by the preview add-on.
#[derive(Debug)]
pub struct StatusReader {
    path: PathBuf,
    file: File,
    /// Raw bytes behind `reading`, to skip rewrites with unchanged content.
    last: Vec<u8>,
    reading: Reading,
}

impl StatusReader {
    pub async fn open(path: PathBuf) -> Result<(Self, Reading), ReaderError> {
        let file = File::open(&path)
            .await
            .map_err(|source| ReaderError::Open {
                path: path.clone(),
                source,
            })?;
        let mut reader = Self {
            path,
            file,
            last: Vec::new(),
            reading: Reading::default(),
        };
        let reading = match reader.process().await {
            Ok((reading, _)) => reading,
            Err(err) if err.is_recoverable() => {
                warn!(path = %reader.path.display(), error = %err, "unreadable status record, starting from defaults");
                reader.reading.clone()
            }
            Err(err) => return Err(err),
        };
        Ok((reader, reading))
    }

    async fn read_record(&mut self) -> Result<Vec<u8>, ReaderError> {
        self.file.seek(SeekFrom::Start(0)).await?;
        let mut buf = [0u8; MAX_RECORD];
        let mut filled = 0;
        while filled < MAX_RECORD {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(buf[..filled].to_vec())
    }
}

#[async_trait]
impl StateReader for StatusReader {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn process(&mut self) -> Result<(Reading, bool), ReaderError> {
        let record = self.read_record().await?;
        // Empty while the file is being rewritten.
        if record.is_empty() || record == self.last {
            return Ok((self.reading.clone(), false));
        }

        let parsed = parse_record(&String::from_utf8_lossy(&record), &self.reading);
        // A malformed record is reported once, not on every poll.
        self.last = record;
        let next = parsed?;
        let updated = next != self.reading;
        self.reading = next;
        Ok((self.reading.clone(), updated))
    }

    async fn process_event(&mut self, change: ChangeKind) -> Result<(), ReaderError> {
        match change {
            ChangeKind::Removed => Err(ReaderError::SourceGone(self.path.clone())),
            ChangeKind::Created | ChangeKind::Modified => Ok(()),
        }
    }
}

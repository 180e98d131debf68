//! State readers turn an instance's state source into lifecycle readings.

mod log;
mod status;
mod watch;

pub use log::LogReader;
pub use status::{StatusReader, parse_record};
pub use watch::SourceWatcher;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::ReaderError,
    instance::{InstanceInfo, Position},
};

/// Raw reader output. `World` is resolved by the worker before it is ever
/// published as a [`crate::instance::StateKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadKind {
    #[default]
    Menu,
    Dirt,
    Preview,
    World,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reading {
    pub kind: ReadKind,
    pub progress: u8,
    pub menu: bool,
    pub spawn: Option<Position>,
}

/// Non-content change to a state source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Created,
    Removed,
}

#[async_trait]
pub trait StateReader: Send {
    fn path(&self) -> &Path;

    /// Consumes whatever the source gained since the last call and returns the
    /// latest reading, and whether anything changed.
    async fn process(&mut self) -> Result<(Reading, bool), ReaderError>;

    /// Handles a creation or removal of the source. An error is unrecoverable.
    async fn process_event(&mut self, change: ChangeKind) -> Result<(), ReaderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderChoice {
    /// Status file when the instance supports it, log otherwise.
    #[default]
    Auto,
    Log,
    Status,
}

/// Opens the best reader for `info` and returns it with its initial reading.
pub async fn open_reader(
    info: &InstanceInfo,
    choice: ReaderChoice,
) -> Result<(Box<dyn StateReader>, Reading), ReaderError> {
    let status_path = info.status_path();
    let has_status = tokio::fs::try_exists(&status_path).await?;

    let use_status = match choice {
        ReaderChoice::Log => false,
        ReaderChoice::Status if !has_status => {
            return Err(ReaderError::StatusUnavailable(status_path));
        }
        ReaderChoice::Status => true,
        ReaderChoice::Auto => info.status_output && has_status,
    };

    if use_status {
        let (reader, reading) = StatusReader::open(status_path).await?;
        debug!(instance = info.id, "using status reader");
        Ok((Box::new(reader), reading))
    } else {
        let (reader, reading) = LogReader::open(info.log_path()).await?;
        debug!(instance = info.id, "using log reader");
        Ok((Box::new(reader), reading))
    }
}

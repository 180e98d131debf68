use std::{io, path::PathBuf, process::ExitStatus};

use thiserror::Error;

use crate::{
    instance::{InstanceId, StateKind},
    window::WindowId,
};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Failed to open state source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("State source I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Unrecognized status token: {0:?}")]
    UnknownToken(String),

    #[error("Status token {token} is missing its argument")]
    MissingArgument { token: &'static str },

    #[error("Status token {token} has an invalid argument: {arg:?}")]
    InvalidArgument { token: &'static str, arg: String },

    #[error("State source {0} is gone")]
    SourceGone(PathBuf),

    #[error("Cannot force the status reader without {0}")]
    StatusUnavailable(PathBuf),
}

impl ReaderError {
    /// Transient failures and malformed records leave the reader usable;
    /// everything else ends the worker.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReaderError::Io(_)
                | ReaderError::MissingArgument { .. }
                | ReaderError::InvalidArgument { .. }
        )
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            ReaderError::Open { .. } => "reader_open",
            ReaderError::Io(_) => "reader_io",
            ReaderError::UnknownToken(_) => "reader_unknown_token",
            ReaderError::MissingArgument { .. } => "reader_missing_argument",
            ReaderError::InvalidArgument { .. } => "reader_invalid_argument",
            ReaderError::SourceGone(_) => "reader_source_gone",
            ReaderError::StatusUnavailable(_) => "reader_status_unavailable",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum WindowError {
    #[error("Window request failed: {0}")]
    Request(String),

    #[error("Window {0} does not exist")]
    NoSuchWindow(WindowId),

    #[error("Windowing connection closed")]
    Disconnected,
}

#[derive(Debug, Clone, Error)]
pub enum OverlayError {
    #[error("Overlay request failed: {0}")]
    Request(String),

    #[error("Overlay connection closed")]
    Disconnected,
}

/// Failure of a single worker action such as a reset or focus.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    #[error("Instance {id} cannot do that while in state {state}")]
    IllegalState { id: InstanceId, state: StateKind },

    #[error(transparent)]
    Window(#[from] WindowError),
}

impl ActionError {
    /// Illegal-state errors are part of normal use and are not logged as failures.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, ActionError::IllegalState { .. })
    }
}

#[derive(Debug, Error)]
pub enum WorkerFailure {
    #[error("Worker is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("State source watcher closed")]
    WatcherClosed,
}

/// Report sent from a dying worker to its coordinator, which then owns recovery.
#[derive(Debug, Error)]
#[error("Worker {id} failed: {error}")]
pub struct WorkerError {
    pub id: InstanceId,
    #[source]
    pub error: WorkerFailure,
    pub fatal: bool,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("No instances to manage")]
    NoInstances,

    #[error("Coordinator is already running")]
    AlreadyRunning,

    #[error("Failed to start worker {id}: {source}")]
    StartWorker {
        id: InstanceId,
        #[source]
        source: WorkerFailure,
    },

    #[error("Failed to reboot worker {id}: {source}")]
    RebootFailed {
        id: InstanceId,
        #[source]
        source: WorkerFailure,
    },

    #[error("Worker {id} failed again after its reboot")]
    RebootExhausted { id: InstanceId },

    #[error("Could not find a grid window titled {title:?}")]
    GridWindowMissing { title: String },

    #[error("Input event stream closed")]
    InputClosed,

    #[error("Coordinator task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Affinity(#[from] AffinityError),

    #[error(transparent)]
    Counter(#[from] CounterError),
}

impl CoordinatorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CoordinatorError::NoInstances => "coordinator_no_instances",
            CoordinatorError::AlreadyRunning => "coordinator_already_running",
            CoordinatorError::StartWorker { .. } => "coordinator_start_worker",
            CoordinatorError::RebootFailed { .. } => "coordinator_reboot_failed",
            CoordinatorError::RebootExhausted { .. } => "coordinator_reboot_exhausted",
            CoordinatorError::GridWindowMissing { .. } => "coordinator_grid_window_missing",
            CoordinatorError::InputClosed => "coordinator_input_closed",
            CoordinatorError::Panicked(_) => "coordinator_panicked",
            CoordinatorError::Window(_) => "coordinator_window",
            CoordinatorError::Overlay(_) => "coordinator_overlay",
            CoordinatorError::Affinity(_) => "coordinator_affinity",
            CoordinatorError::Counter(_) => "coordinator_counter",
        }
    }
}

#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("Not enough CPUs for {policy} affinity: need {needed}, have {available}")]
    NotEnoughCores {
        policy: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Affinity pool {0} must contain at least one CPU")]
    EmptyPool(&'static str),

    #[error("Failed to set affinity of instance {id} (pid {pid}): {source}")]
    Apply {
        id: InstanceId,
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("CPU affinity is not supported on this build")]
    Unsupported,

    #[error("Invalid affinity setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Failed to open reset count file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Reset count file {path} does not hold a number: {raw:?}")]
    Parse { path: PathBuf, raw: String },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No instances found")]
    Empty,

    #[error("Instance ids are not dense: expected {expected}, found {found}")]
    NotDense { expected: InstanceId, found: InstanceId },

    #[error("Instance discovery I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Instance discovery failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Failed to spawn hook {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Hook {command:?} exited with {status}")]
    Failed { command: String, status: ExitStatus },
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("Failed to listen for shutdown signals: {0}")]
    Signal(#[source] io::Error),
}

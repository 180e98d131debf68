//! Background reset daemon for many concurrent game instances.
//!
//! Each instance gets an [`InstanceWorker`] that tracks its state from a log
//! or status file and injects keys into its window. A [`Coordinator`] turns
//! global and per-cell hotkeys into worker actions, either cycling through
//! instances or driving a grid of them. The windowing, overlay and discovery
//! collaborators are traits supplied by the embedding program.

pub mod affinity;
pub mod config;
pub mod coordinator;
pub mod counter;
pub mod daemon;
pub mod error;
pub mod hooks;
pub mod instance;
pub mod logging;
pub mod overlay;
pub mod reader;
pub mod window;
pub mod worker;

pub use config::Config;
pub use coordinator::{Collaborators, Coordinator};
pub use daemon::Daemon;
pub use instance::{InstanceId, InstanceInfo, InstanceState, StateKind, Update};
pub use worker::InstanceWorker;

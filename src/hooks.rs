//! User shell commands run on coordinator events.
//!
//! Each hook runs through `sh -c` with `RESETGUARD_INSTANCE` set to the
//! instance id. Hooks never block the coordinator; failures are logged.

use std::{fmt, process::Stdio};

use serde::{Deserialize, Serialize};
use tokio::{process::Command, task::JoinHandle};
use tracing::{debug, warn};

use crate::{error::HookError, instance::InstanceId};

pub const INSTANCE_ENV: &str = "RESETGUARD_INSTANCE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Reset,
    Lock,
    Unlock,
    Play,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HookKind::Reset => write!(f, "reset"),
            HookKind::Lock => write!(f, "lock"),
            HookKind::Unlock => write!(f, "unlock"),
            HookKind::Play => write!(f, "play"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hooks {
    pub reset: Option<String>,
    pub lock: Option<String>,
    pub unlock: Option<String>,
    pub play: Option<String>,
}

impl Hooks {
    pub fn command(&self, kind: HookKind) -> Option<&str> {
        match kind {
            HookKind::Reset => self.reset.as_deref(),
            HookKind::Lock => self.lock.as_deref(),
            HookKind::Unlock => self.unlock.as_deref(),
            HookKind::Play => self.play.as_deref(),
        }
    }

    /// Runs the hook for `kind` in the background. Returns `None` when no
    /// command is configured.
    pub fn fire(&self, kind: HookKind, id: InstanceId) -> Option<JoinHandle<()>> {
        let command = self.command(kind)?.to_string();
        Some(tokio::spawn(async move {
            if let Err(err) = run(&command, id).await {
                warn!(instance = id, hook = %kind, error = %err, "hook failed");
            }
        }))
    }
}

pub async fn run(command: &str, id: InstanceId) -> Result<(), HookError> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env(INSTANCE_ENV, id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|source| HookError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(HookError::Failed {
            command: command.to_string(),
            status,
        });
    }
    debug!(instance = id, command, "hook finished");
    Ok(())
}

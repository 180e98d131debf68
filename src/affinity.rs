//! CPU affinity for instance processes.
//!
//! Static policies pin every instance once at startup. The advanced policy
//! keeps running and moves instances between core pools as their states
//! change. Feasibility is checked before any worker starts, since changing
//! the layout mid-run is disruptive.

mod advanced;

pub use advanced::{AdvancedAffinity, Group};

use std::{io, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::AffinityError,
    instance::{InstanceId, InstanceInfo, Update},
};

const COMMAND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum AffinityPolicy {
    #[default]
    None,
    /// One exclusive core per instance.
    Sequence,
    /// Every other core, one per instance.
    Alternate,
    /// Two adjacent cores per instance.
    Double,
    Advanced(AdvancedAffinity),
}

impl AffinityPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            AffinityPolicy::None => "none",
            AffinityPolicy::Sequence => "sequence",
            AffinityPolicy::Alternate => "alternate",
            AffinityPolicy::Double => "double",
            AffinityPolicy::Advanced(_) => "advanced",
        }
    }

    /// Checks what can be checked without knowing the machine.
    pub fn validate_shape(&self) -> Result<(), AffinityError> {
        match self {
            AffinityPolicy::Advanced(adv) => adv.validate_shape(),
            _ => Ok(()),
        }
    }
}

/// Sorted set of CPU indices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoreSet(Vec<usize>);

impl CoreSet {
    pub fn new<I: IntoIterator<Item = usize>>(cores: I) -> Self {
        let mut cores: Vec<_> = cores.into_iter().collect();
        cores.sort_unstable();
        cores.dedup();
        Self(cores)
    }

    pub fn cores(&self) -> &[usize] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Core sets for a static policy, one per instance.
pub fn plan(
    policy: &AffinityPolicy,
    instances: usize,
    available: usize,
) -> Result<Vec<CoreSet>, AffinityError> {
    let needed = match policy {
        AffinityPolicy::None | AffinityPolicy::Advanced(_) => return Ok(Vec::new()),
        AffinityPolicy::Sequence => instances,
        AffinityPolicy::Alternate | AffinityPolicy::Double => instances * 2,
    };
    if needed > available {
        return Err(AffinityError::NotEnoughCores {
            policy: policy.name(),
            needed,
            available,
        });
    }
    Ok((0..instances)
        .map(|i| match policy {
            AffinityPolicy::Sequence => CoreSet::new([i]),
            AffinityPolicy::Alternate => CoreSet::new([i * 2]),
            _ => CoreSet::new([i * 2, i * 2 + 1]),
        })
        .collect())
}

/// Applies core sets to processes.
pub trait AffinitySink: Send + Sync {
    fn available(&self) -> usize;

    fn apply(&self, pid: u32, cores: &CoreSet) -> io::Result<()>;

    fn supported(&self) -> bool {
        true
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `sched_setaffinity` on the instance's process.
#[cfg(all(feature = "affinity", target_os = "linux"))]
#[derive(Debug, Default)]
pub struct SchedAffinity;

#[cfg(all(feature = "affinity", target_os = "linux"))]
impl AffinitySink for SchedAffinity {
    fn available(&self) -> usize {
        available_parallelism()
    }

    fn apply(&self, pid: u32, cores: &CoreSet) -> io::Result<()> {
        use nix::{
            sched::{CpuSet, sched_setaffinity},
            unistd::Pid,
        };

        let mut set = CpuSet::new();
        for &core in cores.cores() {
            set.set(core)?;
        }
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        sched_setaffinity(Pid::from_raw(pid), &set)?;
        Ok(())
    }
}

/// Sink for builds without affinity support.
#[derive(Debug, Default)]
pub struct NoAffinity;

impl AffinitySink for NoAffinity {
    fn available(&self) -> usize {
        available_parallelism()
    }

    fn apply(&self, _pid: u32, _cores: &CoreSet) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "affinity not supported",
        ))
    }

    fn supported(&self) -> bool {
        false
    }
}

pub fn default_sink() -> Arc<dyn AffinitySink> {
    #[cfg(all(feature = "affinity", target_os = "linux"))]
    {
        Arc::new(SchedAffinity)
    }
    #[cfg(not(all(feature = "affinity", target_os = "linux")))]
    {
        Arc::new(NoAffinity)
    }
}

/// Validated affinity layout, ready to be applied once workers run.
pub struct AffinityController {
    policy: AffinityPolicy,
    instances: Vec<InstanceInfo>,
    sink: Arc<dyn AffinitySink>,
    plan: Vec<CoreSet>,
}

impl AffinityController {
    pub fn new(
        policy: AffinityPolicy,
        instances: &[InstanceInfo],
        sink: Arc<dyn AffinitySink>,
    ) -> Result<Self, AffinityError> {
        if policy != AffinityPolicy::None && !sink.supported() {
            return Err(AffinityError::Unsupported);
        }
        policy.validate_shape()?;
        let available = sink.available();
        let plan = plan(&policy, instances.len(), available)?;
        if let AffinityPolicy::Advanced(adv) = &policy {
            adv.pools(available)?;
        }
        Ok(Self {
            policy,
            instances: instances.to_vec(),
            sink,
            plan,
        })
    }

    pub fn start(self) -> Result<AffinityHandle, AffinityError> {
        match self.policy {
            AffinityPolicy::None => Ok(AffinityHandle::inert()),
            AffinityPolicy::Advanced(adv) => {
                let pools = adv.pools(self.sink.available())?;
                let pids = self.instances.iter().map(|i| i.pid).collect();
                let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
                let cancel = CancellationToken::new();
                let task = tokio::spawn(advanced::run(
                    adv,
                    pools,
                    pids,
                    self.sink,
                    rx,
                    cancel.clone(),
                ));
                info!("advanced affinity running");
                Ok(AffinityHandle {
                    inner: Some(Running { tx, cancel, task }),
                })
            }
            _ => {
                for (info, cores) in self.instances.iter().zip(&self.plan) {
                    self.sink
                        .apply(info.pid, cores)
                        .map_err(|source| AffinityError::Apply {
                            id: info.id,
                            pid: info.pid,
                            source,
                        })?;
                    debug!(instance = info.id, cores = ?cores.cores(), "pinned");
                }
                info!(policy = self.policy.name(), "affinity applied");
                Ok(AffinityHandle::inert())
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Update(Update),
    Priority(InstanceId, bool),
}

struct Running {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Feeds a running affinity controller. Inert for static policies.
pub struct AffinityHandle {
    inner: Option<Running>,
}

impl AffinityHandle {
    pub fn inert() -> Self {
        Self { inner: None }
    }

    pub fn update(&self, update: &Update) {
        self.send(Command::Update(update.clone()));
    }

    /// Prioritized instances stay on the high pool whatever their state.
    pub fn set_priority(&self, id: InstanceId, priority: bool) {
        self.send(Command::Priority(id, priority));
    }

    fn send(&self, command: Command) {
        if let Some(running) = &self.inner
            && running.tx.try_send(command).is_err()
        {
            warn!("affinity controller not keeping up, dropping command");
        }
    }

    pub async fn stop(self) {
        if let Some(running) = self.inner {
            running.cancel.cancel();
            _ = running.task.await;
        }
    }
}

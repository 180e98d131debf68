use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::{sync::CancellationToken, time::DelayQueue};
use tracing::{debug, warn};

use crate::{
    error::AffinityError,
    instance::{InstanceId, StateKind, Update},
};

use super::{AffinitySink, Command, CoreSet};

/// Pool sizes in cores, laid out in order from core 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedAffinity {
    pub idle: usize,
    pub low: usize,
    pub mid: usize,
    pub high: usize,
    pub active: usize,
    /// Preview progress above which an instance drops to the low pool.
    pub low_threshold: u8,
    /// How long a freshly generated instance keeps the mid pool, in ms.
    pub burst: u64,
}

impl Default for AdvancedAffinity {
    fn default() -> Self {
        Self {
            idle: 1,
            low: 1,
            mid: 2,
            high: 2,
            active: 2,
            low_threshold: 50,
            burst: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Idle = 0,
    Low = 1,
    Mid = 2,
    High = 3,
    Active = 4,
}

impl AdvancedAffinity {
    pub fn validate_shape(&self) -> Result<(), AffinityError> {
        let sizes = [
            ("idle", self.idle),
            ("low", self.low),
            ("mid", self.mid),
            ("high", self.high),
            ("active", self.active),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, n)| *n == 0) {
            return Err(AffinityError::EmptyPool(*name));
        }
        if self.low_threshold > 100 {
            return Err(AffinityError::Invalid(
                "low_threshold must be at most 100".into(),
            ));
        }
        Ok(())
    }

    /// Splits the first cores of the machine into the five pools.
    pub fn pools(&self, available: usize) -> Result<[CoreSet; 5], AffinityError> {
        self.validate_shape()?;
        let needed = self.idle + self.low + self.mid + self.high + self.active;
        if needed > available {
            return Err(AffinityError::NotEnoughCores {
                policy: "advanced",
                needed,
                available,
            });
        }
        let mut next = 0;
        let mut take = |n: usize| {
            let set = CoreSet::new(next..next + n);
            next += n;
            set
        };
        Ok([
            take(self.idle),
            take(self.low),
            take(self.mid),
            take(self.high),
            take(self.active),
        ])
    }

    fn burst(&self) -> Option<Duration> {
        (self.burst > 0).then(|| Duration::from_millis(self.burst))
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    kind: StateKind,
    progress: u8,
    group: Group,
    priority: bool,
}

/// Group bookkeeping of the advanced controller. Only one task owns it.
pub(super) struct Pools {
    conf: AdvancedAffinity,
    sets: [CoreSet; 5],
    pids: Vec<u32>,
    slots: Vec<Slot>,
    sink: Arc<dyn AffinitySink>,
}

impl Pools {
    pub(super) fn new(
        conf: AdvancedAffinity,
        sets: [CoreSet; 5],
        pids: Vec<u32>,
        sink: Arc<dyn AffinitySink>,
    ) -> Self {
        let slots = vec![
            Slot {
                kind: StateKind::Menu,
                progress: 0,
                group: Group::High,
                priority: false,
            };
            pids.len()
        ];
        Self {
            conf,
            sets,
            pids,
            slots,
            sink,
        }
    }

    pub(super) fn group(&self, id: InstanceId) -> Group {
        self.slots[id].group
    }

    fn any_active(&self) -> bool {
        self.slots.iter().any(|s| s.group == Group::Active)
    }

    /// Moves every instance to the high pool, used on start and stop.
    pub(super) fn reset_all(&mut self) {
        for id in 0..self.slots.len() {
            self.slots[id].group = Group::High;
            self.apply(id);
        }
    }

    /// Returns a burst deadline to schedule for `update.id`, if any.
    pub(super) fn handle_update(&mut self, update: &Update) -> Option<Duration> {
        let id = update.id;
        if id >= self.slots.len() {
            warn!(instance = id, "affinity update for unknown instance");
            return None;
        }
        let prev = self.slots[id];
        let state = &update.state;
        let changed = prev.kind != state.kind;
        let mut burst = None;

        match state.kind {
            StateKind::Idle => match self.conf.burst() {
                None => self.move_to(id, Group::Idle),
                Some(length) if changed => {
                    self.move_to(id, Group::Mid);
                    burst = Some(length);
                }
                Some(_) => {}
            },
            StateKind::Dirt => self.move_to(id, self.generating_group()),
            StateKind::Preview => {
                let threshold = self.conf.low_threshold;
                if prev.progress <= threshold && state.progress > threshold {
                    self.move_to(id, Group::Low);
                } else if changed {
                    self.move_to(id, self.generating_group());
                }
            }
            StateKind::Ingame => self.move_to(id, Group::Active),
            StateKind::Menu => {}
        }

        let slot = &mut self.slots[id];
        slot.kind = state.kind;
        slot.progress = state.progress;
        burst
    }

    /// A burst ended; the instance settles on the idle pool if still idle.
    pub(super) fn end_burst(&mut self, id: InstanceId) {
        if self.slots[id].kind == StateKind::Idle {
            self.move_to(id, Group::Idle);
        }
    }

    pub(super) fn set_priority(&mut self, id: InstanceId, priority: bool) {
        if id >= self.slots.len() {
            return;
        }
        self.slots[id].priority = priority;
        self.apply(id);
    }

    fn generating_group(&self) -> Group {
        if self.any_active() {
            Group::Mid
        } else {
            Group::High
        }
    }

    fn move_to(&mut self, id: InstanceId, group: Group) {
        let prev = self.slots[id].group;
        if prev == group {
            return;
        }
        self.slots[id].group = group;
        self.apply(id);

        // Playing an instance takes headroom from background generation.
        if group == Group::Active {
            for other in 0..self.slots.len() {
                if other != id && self.slots[other].group == Group::High {
                    self.move_to(other, Group::Mid);
                }
            }
        } else if prev == Group::Active && !self.any_active() {
            for other in 0..self.slots.len() {
                if self.slots[other].group == Group::Mid {
                    self.move_to(other, Group::High);
                }
            }
        }
    }

    fn apply(&self, id: InstanceId) {
        let slot = &self.slots[id];
        let group = if slot.priority { Group::High } else { slot.group };
        let cores = &self.sets[group as usize];
        match self.sink.apply(self.pids[id], cores) {
            Ok(()) => debug!(instance = id, ?group, "moved to affinity group"),
            Err(err) => warn!(instance = id, ?group, error = %err, "failed to set affinity"),
        }
    }
}

pub(super) async fn run(
    conf: AdvancedAffinity,
    sets: [CoreSet; 5],
    pids: Vec<u32>,
    sink: Arc<dyn AffinitySink>,
    mut rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    let mut pools = Pools::new(conf, sets, pids, sink);
    let mut bursts: DelayQueue<InstanceId> = DelayQueue::new();
    pools.reset_all();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(Command::Update(update)) => {
                    if let Some(length) = pools.handle_update(&update) {
                        bursts.insert(update.id, length);
                    }
                }
                Some(Command::Priority(id, priority)) => pools.set_priority(id, priority),
                None => break,
            },
            Some(expired) = bursts.next(), if !bursts.is_empty() => {
                pools.end_burst(expired.into_inner());
            }
        }
    }
    pools.reset_all();
}

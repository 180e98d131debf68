use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::time::DelayQueue;

use crate::{
    config::ShowMethod,
    instance::{InstanceId, InstanceState, StateKind},
};

/// Hides grid cells while their instance sits on the dirt screen.
pub(super) struct Hider {
    show: ShowMethod,
    pending: DelayQueue<InstanceId>,
}

impl Hider {
    pub(super) fn new(show: ShowMethod) -> Self {
        Self {
            show,
            pending: DelayQueue::new(),
        }
    }

    pub(super) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Cell visibility to apply right away for a state change, if any. Delayed
    /// shows are queued and come out of [`Hider::next_due`].
    pub(super) fn observe(
        &mut self,
        id: InstanceId,
        prev: &InstanceState,
        next: &InstanceState,
    ) -> Option<bool> {
        if prev.kind != StateKind::Dirt && next.kind == StateKind::Dirt {
            return Some(false);
        }
        if next.kind != StateKind::Preview {
            return None;
        }
        match self.show {
            ShowMethod::Delay { ms } => {
                if prev.kind != StateKind::Preview {
                    self.pending.insert(id, Duration::from_millis(ms));
                }
                None
            }
            ShowMethod::Progress { percent } => {
                let crossed = prev.kind == StateKind::Dirt || prev.progress <= percent;
                (crossed && next.progress > percent).then_some(true)
            }
        }
    }

    pub(super) async fn next_due(&mut self) -> Option<InstanceId> {
        self.pending.next().await.map(|expired| expired.into_inner())
    }
}

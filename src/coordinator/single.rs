use tracing::{debug, info};

use crate::{error::CoordinatorError, instance::InstanceId, window::Timestamp};

use super::{Context, pool::log_action};

/// Plays instances one after another.
pub(super) struct Single {
    current: InstanceId,
}

impl Single {
    pub(super) async fn setup(ctx: &Context) -> Result<Self, CoordinatorError> {
        ctx.overlay.set_scene(ctx.conf.grid.instance_scene(0));
        info!(instances = ctx.pool.len(), "single mode ready");
        Ok(Self { current: 0 })
    }

    pub(super) async fn focus(&mut self, ctx: &Context, time: Timestamp) {
        if let Some(worker) = ctx.pool.get(self.current) {
            log_action("focus", self.current, &worker.focus(time).await);
        }
    }

    /// Moves on to the next instance and resets the one just left.
    pub(super) async fn reset(&mut self, ctx: &Context, time: Timestamp) {
        let count = ctx.pool.len();
        if count == 0 {
            return;
        }
        let next = (self.current + 1) % count;

        if let Some(worker) = ctx.pool.get(next) {
            log_action("focus", next, &worker.focus(time).await);
        }
        if let Some(worker) = ctx.pool.get(self.current)
            && log_action("reset", self.current, &worker.reset(time).await)
        {
            ctx.on_reset(self.current);
        }

        self.current = next;
        ctx.overlay.set_scene(ctx.conf.grid.instance_scene(next));
        debug!(instance = next, "switched instance");
    }
}

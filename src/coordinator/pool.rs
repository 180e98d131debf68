use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinSet, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ActionError, CoordinatorError, WorkerError},
    instance::{InstanceId, InstanceInfo, Update},
    window::{Timestamp, WindowClient},
    worker::{InstanceWorker, WorkerConfig},
};

/// How many times a failed worker is restarted before the coordinator gives up.
pub const MAX_REBOOTS: u32 = 1;

/// Every worker of one coordinator, indexed by instance id.
pub struct WorkerPool {
    workers: Vec<Arc<InstanceWorker>>,
    errors: mpsc::Sender<WorkerError>,
    reboots: Vec<u32>,
    reboot_delay: Duration,
}

impl WorkerPool {
    pub fn new(
        instances: Vec<InstanceInfo>,
        conf: WorkerConfig,
        window: Arc<dyn WindowClient>,
        updates: mpsc::Sender<Update>,
        errors: mpsc::Sender<WorkerError>,
        reboot_delay: Duration,
    ) -> Self {
        let reboots = vec![0; instances.len()];
        let workers = instances
            .into_iter()
            .map(|info| {
                Arc::new(InstanceWorker::new(
                    info,
                    conf.clone(),
                    window.clone(),
                    updates.clone(),
                ))
            })
            .collect();
        Self {
            workers,
            errors,
            reboots,
            reboot_delay,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, id: InstanceId) -> Option<&Arc<InstanceWorker>> {
        self.workers.get(id)
    }

    pub fn infos(&self) -> Vec<InstanceInfo> {
        self.workers.iter().map(|w| w.info().clone()).collect()
    }

    /// Starts every worker; on failure the ones already started are stopped.
    pub async fn start_all(&self) -> Result<(), CoordinatorError> {
        for worker in &self.workers {
            if let Err(source) = worker.start(self.errors.clone()).await {
                self.stop_all().await;
                return Err(CoordinatorError::StartWorker {
                    id: worker.id(),
                    source,
                });
            }
        }
        info!(count = self.workers.len(), "workers started");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let mut set = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            set.spawn(async move { worker.stop().await });
        }
        while set.join_next().await.is_some() {}
        debug!("workers stopped");
    }

    /// Handles a worker failure: one reboot per instance, then the failure is
    /// the coordinator's.
    pub async fn supervise(&mut self, failure: WorkerError) -> Result<(), CoordinatorError> {
        let id = failure.id;
        if !failure.fatal {
            warn!(instance = id, error = %failure.error, "worker reported an error");
            return Ok(());
        }
        error!(instance = id, error = %failure.error, "worker died");

        let Some(worker) = self.workers.get(id) else {
            warn!(instance = id, "failure from unknown worker");
            return Ok(());
        };
        if self.reboots[id] >= MAX_REBOOTS {
            return Err(CoordinatorError::RebootExhausted { id });
        }
        self.reboots[id] += 1;

        sleep(self.reboot_delay).await;
        worker
            .start(self.errors.clone())
            .await
            .map_err(|source| CoordinatorError::RebootFailed { id, source })?;
        info!(instance = id, "worker rebooted");
        Ok(())
    }

    /// Resets the given instances concurrently and waits for all of them.
    pub async fn reset_many<I>(&self, ids: I, time: Timestamp) -> Vec<(InstanceId, Result<(), ActionError>)>
    where
        I: IntoIterator<Item = InstanceId>,
    {
        let mut set = JoinSet::new();
        for id in ids {
            let Some(worker) = self.workers.get(id).cloned() else {
                continue;
            };
            set.spawn(async move { (id, worker.reset(time).await) });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(error = %err, "reset task panicked"),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        results
    }
}

/// Logs the outcome of a worker action. Illegal-state refusals are expected.
pub fn log_action(action: &str, id: InstanceId, result: &Result<(), ActionError>) -> bool {
    match result {
        Ok(()) => {
            debug!(instance = id, action, "done");
            true
        }
        Err(err) if err.is_illegal_state() => {
            debug!(instance = id, action, reason = %err, "skipped");
            false
        }
        Err(err) => {
            warn!(instance = id, action, error = %err, "failed");
            false
        }
    }
}

//! Top-level driver: discovery, one coordinator run, one restart.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    coordinator::{Collaborators, Coordinator},
    error::DaemonError,
    instance::{Discovery, InstanceInfo, validate_dense},
};

/// Full-system restarts allowed after a fatal coordinator error.
pub const MAX_RESTARTS: u32 = 1;

pub struct Daemon {
    conf: Arc<Config>,
    discovery: Arc<dyn Discovery>,
    deps: Collaborators,
}

impl Daemon {
    pub fn new(conf: Arc<Config>, discovery: Arc<dyn Discovery>, deps: Collaborators) -> Self {
        Self {
            conf,
            discovery,
            deps,
        }
    }

    /// Runs until `shutdown` is cancelled. A fatal failure rediscovers the
    /// instances and starts over once; the next failure is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let coordinator = Coordinator::new(self.conf.clone(), self.deps.clone());
        let mut restarts = 0;
        loop {
            match self.run_once(&coordinator, &shutdown).await {
                Ok(()) => return Ok(()),
                Err(err) if restarts < MAX_RESTARTS && !shutdown.is_cancelled() => {
                    restarts += 1;
                    error!(error = %err, restarts, "daemon failed, restarting");
                }
                Err(err) => {
                    error!(error = %err, "daemon failed");
                    return Err(err);
                }
            }
        }
    }

    /// Like [`Daemon::run`], shutting down on SIGINT, SIGTERM or SIGQUIT.
    pub async fn run_until_signal(&self) -> Result<(), DaemonError> {
        let shutdown = CancellationToken::new();
        let run = self.run(shutdown.clone());
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            signal = wait_for_shutdown_signal() => {
                shutdown.cancel();
                if let Err(err) = signal {
                    let result = run.await;
                    warn!(?result, "stopped after signal setup failed");
                    return Err(DaemonError::Signal(err));
                }
                info!("shutdown signal received");
            }
        }
        run.await
    }

    async fn run_once(
        &self,
        coordinator: &Coordinator,
        shutdown: &CancellationToken,
    ) -> Result<(), DaemonError> {
        let instances = validate_dense(self.discovery.discover().await?)?;
        let instances = self.detect_capabilities(instances).await;
        info!(count = instances.len(), "discovered instances");

        coordinator.start(instances).await?;
        tokio::select! {
            _ = shutdown.cancelled() => {
                coordinator.stop().await;
                coordinator.wait().await?;
            }
            result = coordinator.wait() => result?,
        }
        Ok(())
    }

    #[cfg(feature = "status-output")]
    async fn detect_capabilities(&self, mut instances: Vec<InstanceInfo>) -> Vec<InstanceInfo> {
        let digests = &self.conf.status_output_digests;
        if digests.is_empty() {
            return instances;
        }
        for info in instances.iter_mut().filter(|i| !i.status_output) {
            match crate::instance::detect_status_output(&info.dir, digests).await {
                Ok(found) => info.status_output = found,
                Err(err) => warn!(instance = info.id, error = %err, "status output detection failed"),
            }
        }
        instances
    }

    #[cfg(not(feature = "status-output"))]
    async fn detect_capabilities(&self, instances: Vec<InstanceInfo>) -> Vec<InstanceInfo> {
        instances
    }
}

/// Waits for a termination signal.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

//! Provisioner - start a worker on a reserved port and learn its real pid.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::supervisor::{LaunchCommand, ProcessId, ProcessSupervisor, SupervisorError};

/// Identities of a freshly started worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provisioned {
    pub launcher: ProcessId,
    pub worker: ProcessId,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to start worker on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: SupervisorError,
    },
    #[error("failed to resolve worker on port {port}: {source}")]
    Resolve {
        port: u16,
        #[source]
        source: SupervisorError,
    },
    #[error("worker on port {port} did not appear within {timeout:?}")]
    Timeout { port: u16, timeout: Duration },
}

impl ProvisionError {
    pub fn port(&self) -> u16 {
        match self {
            ProvisionError::Spawn { port, .. }
            | ProvisionError::Resolve { port, .. }
            | ProvisionError::Timeout { port, .. } => *port,
        }
    }
}

pub struct Provisioner {
    supervisor: Arc<dyn ProcessSupervisor>,
    worker_path: PathBuf,
    resolve_timeout: Duration,
    resolve_interval: Duration,
}

impl Provisioner {
    pub fn new(supervisor: Arc<dyn ProcessSupervisor>, config: &PoolConfig) -> Self {
        Self {
            supervisor,
            worker_path: config.worker_path.clone(),
            resolve_timeout: config.resolve_timeout,
            resolve_interval: config.resolve_interval,
        }
    }

    /// Start a worker listening on `port` and wait for its identity.
    ///
    /// The port must already be reserved by the caller. On failure the
    /// launcher is terminated and the caller must not mark the slot running.
    pub async fn provision(&self, port: u16) -> Result<Provisioned, ProvisionError> {
        let command = LaunchCommand::new(&self.worker_path, port);
        let launcher = self
            .supervisor
            .spawn(&command)
            .await
            .map_err(|source| ProvisionError::Spawn { port, source })?;

        tracing::debug!(port, launcher = %launcher, "Launcher started, resolving worker");

        let error = match tokio::time::timeout(self.resolve_timeout, self.resolve(launcher)).await {
            Ok(Ok(worker)) => return Ok(Provisioned { launcher, worker }),
            Ok(Err(source)) => ProvisionError::Resolve { port, source },
            Err(_) => ProvisionError::Timeout {
                port,
                timeout: self.resolve_timeout,
            },
        };

        self.abandon(port, launcher);
        Err(error)
    }

    /// Poll until the launcher has exactly one descendant.
    async fn resolve(&self, launcher: ProcessId) -> Result<ProcessId, SupervisorError> {
        loop {
            match self.supervisor.resolve_child(launcher).await {
                Err(SupervisorError::NoDescendant { .. }) => {
                    tokio::time::sleep(self.resolve_interval).await;
                }
                other => return other,
            }
        }
    }

    /// Stop the launcher and anything it already started.
    fn abandon(&self, port: u16, launcher: ProcessId) {
        match self.supervisor.kill_tree(launcher) {
            Ok(()) | Err(SupervisorError::NotFound(_)) => {
                tracing::debug!(port, launcher = %launcher, "Abandoned launcher");
            }
            Err(e) => {
                tracing::warn!(
                    port,
                    launcher = %launcher,
                    error = %e,
                    "Failed to terminate abandoned launcher"
                );
            }
        }
    }
}

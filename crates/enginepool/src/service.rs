//! PoolService: the request handler sitting in front of the slot table.
//!
//! This service owns:
//! - The slot table (constructed once, torn down by `shutdown()`)
//! - Admission (free slot or idle eviction)
//! - Provisioning through a `ProcessSupervisor`
//!
//! Every slot transition happens inside `SlotTable::transact`, so concurrent
//! acquires can interleave at await points without ever sharing a port.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::admission::{Admission, AdmissionPolicy};
use crate::config::{ConfigError, PoolConfig};
use crate::provisioner::{ProvisionError, Provisioned, Provisioner};
use crate::slot::{Occupant, Orphan, SlotState, SlotTable};
use crate::supervisor::{ProcessId, ProcessSupervisor, SupervisorError};

/// A port handed to a client together with the worker bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub port: u16,
    pub worker_id: ProcessId,
}

impl Lease {
    /// `{port: 0, workerId: 0}` - what clients see when no worker could be had.
    pub const NONE: Lease = Lease {
        port: 0,
        worker_id: ProcessId::NONE,
    };
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("no free slot and no worker idle long enough to evict")]
    CapacityExhausted,
    #[error(transparent)]
    ProvisionFailed(#[from] ProvisionError),
    #[error("slot on port {port} was reclaimed while provisioning")]
    Reclaimed { port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Port/worker did not match a running slot; nothing changed.
    Stale,
}

/// Holds a `Provisioning` reservation. Frees the slot on drop unless committed,
/// so a failed or cancelled acquire never leaves a port stuck.
struct Reservation<'a> {
    table: &'a SlotTable,
    port: u16,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(table: &'a SlotTable, port: u16) -> Self {
        Self {
            table,
            port,
            armed: true,
        }
    }

    /// Promote the reservation to `Running`. Returns `false` if the slot was
    /// taken away in the meantime (shutdown).
    fn commit(mut self, provisioned: Provisioned) -> bool {
        self.armed = false;
        let port = self.port;
        self.table.transact(|slots| match slots.get(port) {
            Some(SlotState::Provisioning) => {
                slots.set(
                    port,
                    SlotState::Running(Occupant {
                        launcher: provisioned.launcher,
                        worker: provisioned.worker,
                        last_activity: Instant::now(),
                    }),
                );
                true
            }
            _ => false,
        })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let port = self.port;
        let freed = self.table.transact(|slots| {
            if slots.get(port) == Some(SlotState::Provisioning) {
                slots.clear(port);
                true
            } else {
                false
            }
        });
        if freed {
            tracing::debug!(port, "Reservation dropped, slot freed");
        }
    }
}

pub struct PoolService {
    table: SlotTable,
    policy: AdmissionPolicy,
    provisioner: Provisioner,
    supervisor: Arc<dyn ProcessSupervisor>,
    settle_delay: Duration,
}

impl PoolService {
    pub fn new(
        config: &PoolConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            table: SlotTable::new(config.start_port, config.capacity)?,
            policy: AdmissionPolicy::new(config.idle_threshold),
            provisioner: Provisioner::new(Arc::clone(&supervisor), config),
            supervisor,
            settle_delay: config.settle_delay,
        })
    }

    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    /// Hand out a port with a freshly started worker.
    pub async fn acquire(&self) -> Result<Lease, AcquireError> {
        let admission = self
            .table
            .transact(|slots| self.policy.admit(slots, Instant::now()));

        let reservation = match admission {
            Admission::Fresh { port } => Reservation::new(&self.table, port),
            Admission::Evict { port, evicted } => {
                let reservation = Reservation::new(&self.table, port);
                self.evict(port, evicted);
                tokio::time::sleep(self.settle_delay).await;
                reservation
            }
            Admission::Exhausted => {
                tracing::warn!(
                    capacity = self.table.capacity(),
                    "No free slot and no idle worker to evict"
                );
                return Err(AcquireError::CapacityExhausted);
            }
        };

        let port = reservation.port;
        let provisioned = match self.provisioner.provision(port).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                tracing::error!(port, error = %e, "Provisioning failed");
                return Err(e.into());
            }
        };

        if !reservation.commit(provisioned) {
            tracing::warn!(
                port,
                worker = %provisioned.worker,
                "Slot reclaimed during provisioning, stopping worker"
            );
            self.terminate(port, provisioned.worker);
            return Err(AcquireError::Reclaimed { port });
        }

        tracing::info!(
            port,
            launcher = %provisioned.launcher,
            worker = %provisioned.worker,
            "Worker started"
        );
        Ok(Lease {
            port,
            worker_id: provisioned.worker,
        })
    }

    /// Free `port` if it is running `worker`. Anything else is a no-op.
    ///
    /// The worker process itself is left alone; the client owns its shutdown.
    pub fn release(&self, port: u16, worker: ProcessId) -> ReleaseOutcome {
        let outcome = self.table.transact(|slots| match slots.get(port) {
            Some(SlotState::Running(occupant)) if occupant.worker == worker => {
                slots.clear(port);
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::Stale,
        });

        match outcome {
            ReleaseOutcome::Released => tracing::info!(port, worker = %worker, "Worker released"),
            ReleaseOutcome::Stale => {
                tracing::debug!(port, worker = %worker, "Ignoring stale release")
            }
        }
        outcome
    }

    /// Stop every running worker and any orphan left by a failed eviction.
    pub fn shutdown(&self) {
        let running: Vec<(u16, ProcessId)> = self.table.transact(|slots| {
            let running: Vec<_> = slots
                .iter()
                .filter_map(|(port, state)| state.occupant().map(|o| (port, o.worker)))
                .collect();
            let ports: Vec<u16> = slots.iter().map(|(port, _)| port).collect();
            for port in ports {
                slots.clear(port);
            }
            running
        });
        let orphans = self.table.take_orphans();

        tracing::info!(
            running = running.len(),
            orphans = orphans.len(),
            "Stopping workers"
        );

        for (port, worker) in running {
            self.terminate(port, worker);
        }
        for Orphan { port, worker } in orphans {
            self.terminate(port, worker);
        }
    }

    fn evict(&self, port: u16, evicted: Occupant) {
        let idle_secs = evicted.last_activity.elapsed().as_secs();
        match self.supervisor.kill(evicted.worker) {
            Ok(()) => {
                tracing::info!(port, worker = %evicted.worker, idle_secs, "Evicted idle worker")
            }
            Err(SupervisorError::NotFound(_)) => {
                tracing::info!(
                    port,
                    worker = %evicted.worker,
                    idle_secs,
                    "Idle worker had already exited"
                )
            }
            Err(e) => {
                tracing::warn!(
                    port,
                    worker = %evicted.worker,
                    error = %e,
                    "Failed to terminate evicted worker, tracking as orphan"
                );
                self.table.record_orphan(Orphan {
                    port,
                    worker: evicted.worker,
                });
            }
        }
    }

    fn terminate(&self, port: u16, worker: ProcessId) {
        match self.supervisor.kill(worker) {
            Ok(()) | Err(SupervisorError::NotFound(_)) => {
                tracing::debug!(port, worker = %worker, "Worker terminated")
            }
            Err(e) => {
                tracing::warn!(port, worker = %worker, error = %e, "Failed to terminate worker")
            }
        }
    }
}

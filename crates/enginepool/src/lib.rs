//! enginepool: a pool controller for port-bound worker processes.
//!
//! Clients acquire a port with a freshly started worker behind it and
//! release it when done. The pool is fixed in size; when it is full, the
//! worker idle the longest (past a threshold) is evicted to make room.

pub mod admission;
pub mod config;
pub mod provisioner;
pub mod service;
pub mod slot;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use admission::{Admission, AdmissionPolicy};
pub use config::{ConfigError, PoolConfig, Settings};
pub use provisioner::{ProvisionError, Provisioned, Provisioner};
pub use service::{AcquireError, Lease, PoolService, ReleaseOutcome};
pub use slot::{Occupant, Orphan, SlotState, SlotTable, Slots};
pub use supervisor::{LaunchCommand, OsSupervisor, ProcessId, ProcessSupervisor, SupervisorError};

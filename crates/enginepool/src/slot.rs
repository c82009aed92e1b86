//! Slot table - the authoritative port → worker record.
//!
//! One slot per port in `[start_port, start_port + capacity)`, created `Free`
//! and never destroyed. All state lives behind a single lock; compound
//! read-modify-write steps go through [`SlotTable::transact`], which runs a
//! synchronous closure under that lock so no await point can split an
//! observation from the write that depends on it.

use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use crate::config::{ConfigError, validate_range};
use crate::supervisor::ProcessId;

/// The process pair occupying a running slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    pub launcher: ProcessId,
    pub worker: ProcessId,
    /// Set once when provisioning succeeds; there is no heartbeat.
    pub last_activity: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Free,
    /// Reserved by an in-flight acquire; owned exclusively by it.
    Provisioning,
    Running(Occupant),
}

impl SlotState {
    pub fn is_free(&self) -> bool {
        matches!(self, SlotState::Free)
    }

    pub fn occupant(&self) -> Option<&Occupant> {
        match self {
            SlotState::Running(occupant) => Some(occupant),
            _ => None,
        }
    }
}

/// A worker whose termination failed during eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orphan {
    pub port: u16,
    pub worker: ProcessId,
}

/// Slot states for the fixed port range. Only reachable through the table lock.
#[derive(Debug)]
pub struct Slots {
    start_port: u16,
    states: Vec<SlotState>,
}

impl Slots {
    fn new(start_port: u16, capacity: usize) -> Self {
        Self {
            start_port,
            states: vec![SlotState::Free; capacity],
        }
    }

    fn index(&self, port: u16) -> Option<usize> {
        let offset = usize::from(port.checked_sub(self.start_port)?);
        (offset < self.states.len()).then_some(offset)
    }

    fn port_at(&self, index: usize) -> u16 {
        // The range was validated at construction, so this cannot overflow.
        self.start_port + index as u16
    }

    /// Lowest free port, if any.
    pub fn find_free(&self) -> Option<u16> {
        self.states
            .iter()
            .position(SlotState::is_free)
            .map(|index| self.port_at(index))
    }

    /// State of `port`, or `None` if the port is outside the range.
    pub fn get(&self, port: u16) -> Option<SlotState> {
        self.index(port).map(|index| self.states[index])
    }

    /// Overwrite the state of `port`. Returns `false` for ports outside the range.
    pub fn set(&mut self, port: u16, state: SlotState) -> bool {
        match self.index(port) {
            Some(index) => {
                self.states[index] = state;
                true
            }
            None => false,
        }
    }

    /// Reset `port` to `Free`, returning what was there.
    pub fn clear(&mut self, port: u16) -> Option<SlotState> {
        let index = self.index(port)?;
        Some(std::mem::take(&mut self.states[index]))
    }

    /// Slots in ascending port order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &SlotState)> + '_ {
        self.states
            .iter()
            .enumerate()
            .map(|(index, state)| (self.port_at(index), state))
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    pub fn running(&self) -> usize {
        self.states
            .iter()
            .filter(|state| state.occupant().is_some())
            .count()
    }

    #[cfg(test)]
    pub(crate) fn for_test(start_port: u16, capacity: usize) -> Self {
        Self::new(start_port, capacity)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&mut self, port: u16, at: Instant) {
        if let Some(index) = self.index(port)
            && let SlotState::Running(occupant) = &mut self.states[index]
        {
            occupant.last_activity = at;
        }
    }
}

/// Shared, lock-protected slot table.
pub struct SlotTable {
    slots: StdMutex<Slots>,
    orphans: StdMutex<Vec<Orphan>>,
}

impl SlotTable {
    pub fn new(start_port: u16, capacity: usize) -> Result<Self, ConfigError> {
        validate_range(start_port, capacity)?;
        Ok(Self {
            slots: StdMutex::new(Slots::new(start_port, capacity)),
            orphans: StdMutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // Slots is plain data; a panic mid-closure cannot leave it torn.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to every slot.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Slots) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn find_free(&self) -> Option<u16> {
        self.lock().find_free()
    }

    pub fn get(&self, port: u16) -> Option<SlotState> {
        self.lock().get(port)
    }

    pub fn set(&self, port: u16, state: SlotState) -> bool {
        self.lock().set(port, state)
    }

    pub fn clear(&self, port: u16) -> Option<SlotState> {
        self.lock().clear(port)
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn running(&self) -> usize {
        self.lock().running()
    }

    pub fn record_orphan(&self, orphan: Orphan) {
        self.orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(orphan);
    }

    pub fn take_orphans(&self) -> Vec<Orphan> {
        std::mem::take(&mut *self.orphans.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

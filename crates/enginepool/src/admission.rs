//! Admission policy - which port a new acquisition gets.
//!
//! A free port wins. With none free, the running slot that has been idle the
//! longest is evicted, but only once it is older than the idle threshold.
//! Whatever port is chosen is reserved (`Provisioning`) in the same locked
//! step that chose it.

use std::time::Duration;

use tokio::time::Instant;

use crate::slot::{Occupant, SlotState, Slots};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A free port, now reserved.
    Fresh { port: u16 },
    /// An idle worker's port, now reserved. The caller must terminate
    /// `evicted` and let the port settle before provisioning.
    Evict { port: u16, evicted: Occupant },
    /// Every slot is busy and none is idle long enough to evict.
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    idle_threshold: Duration,
}

impl AdmissionPolicy {
    pub fn new(idle_threshold: Duration) -> Self {
        Self { idle_threshold }
    }

    /// Choose and reserve a port. Must be called under the table lock.
    pub fn admit(&self, slots: &mut Slots, now: Instant) -> Admission {
        if let Some(port) = slots.find_free() {
            slots.set(port, SlotState::Provisioning);
            return Admission::Fresh { port };
        }

        let Some(port) = self.eviction_candidate(slots, now) else {
            return Admission::Exhausted;
        };

        // Running → Free → Provisioning, without releasing the lock in between.
        match slots.clear(port) {
            Some(SlotState::Running(evicted)) => {
                slots.set(port, SlotState::Provisioning);
                Admission::Evict { port, evicted }
            }
            other => {
                tracing::error!(port, state = ?other, "Bug: eviction candidate was not running");
                if let Some(state) = other {
                    slots.set(port, state);
                }
                Admission::Exhausted
            }
        }
    }

    /// Oldest running slot idle for longer than the threshold.
    ///
    /// Ties on `last_activity` go to the lowest port.
    pub fn eviction_candidate(&self, slots: &Slots, now: Instant) -> Option<u16> {
        let mut oldest: Option<(u16, Instant)> = None;
        for (port, state) in slots.iter() {
            let Some(occupant) = state.occupant() else {
                continue;
            };
            if now.saturating_duration_since(occupant.last_activity) <= self.idle_threshold {
                continue;
            }
            if oldest.is_none_or(|(_, at)| occupant.last_activity < at) {
                oldest = Some((port, occupant.last_activity));
            }
        }
        oldest.map(|(port, _)| port)
    }
}

//! In-memory `ProcessSupervisor` for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::supervisor::{LaunchCommand, ProcessId, ProcessSupervisor, SupervisorError};

/// How spawned launchers behave when asked for their descendant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildMode {
    /// One worker, visible immediately.
    Single,
    /// One worker, visible after this many `NoDescendant` answers.
    Delayed(u32),
    /// The worker never appears.
    Missing,
    /// Two descendants.
    Twins,
    /// The process table cannot be read.
    EnumerateFails,
    /// The launcher cannot be started at all.
    SpawnFails,
}

#[derive(Default)]
struct MockState {
    spawned: Vec<LaunchCommand>,
    launchers: Vec<ProcessId>,
    children: HashMap<ProcessId, Vec<ProcessId>>,
    pending: HashMap<ProcessId, u32>,
    killed: Vec<ProcessId>,
    killed_trees: Vec<ProcessId>,
    kill_failures: HashSet<ProcessId>,
}

pub(crate) struct MockSupervisor {
    next_pid: AtomicU32,
    resolve_calls: AtomicUsize,
    mode: Mutex<ChildMode>,
    state: Mutex<MockState>,
}

impl MockSupervisor {
    /// Launcher pids start at 1000; a launcher's worker gets the next pid.
    pub(crate) fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            resolve_calls: AtomicUsize::new(0),
            mode: Mutex::new(ChildMode::Single),
            state: Mutex::new(MockState::default()),
        }
    }

    pub(crate) fn set_mode(&self, mode: ChildMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Make `kill(pid)` fail with a non-`NotFound` error.
    pub(crate) fn fail_kill(&self, pid: ProcessId) {
        self.state.lock().unwrap().kill_failures.insert(pid);
    }

    pub(crate) fn spawned(&self) -> Vec<LaunchCommand> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub(crate) fn launchers(&self) -> Vec<ProcessId> {
        self.state.lock().unwrap().launchers.clone()
    }

    pub(crate) fn killed(&self) -> Vec<ProcessId> {
        self.state.lock().unwrap().killed.clone()
    }

    /// Launchers whose whole process tree was terminated.
    pub(crate) fn killed_trees(&self) -> Vec<ProcessId> {
        self.state.lock().unwrap().killed_trees.clone()
    }

    pub(crate) fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    fn allocate(&self) -> ProcessId {
        ProcessId::new(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ProcessSupervisor for MockSupervisor {
    async fn spawn(&self, command: &LaunchCommand) -> Result<ProcessId, SupervisorError> {
        let mode = *self.mode.lock().unwrap();
        if mode == ChildMode::SpawnFails {
            return Err(SupervisorError::Spawn(std::io::Error::other(
                "mock spawn failure",
            )));
        }

        let launcher = self.allocate();
        let children = match mode {
            ChildMode::Single | ChildMode::Delayed(_) => vec![self.allocate()],
            ChildMode::Twins => vec![self.allocate(), self.allocate()],
            _ => Vec::new(),
        };

        let mut state = self.state.lock().unwrap();
        state.spawned.push(command.clone());
        state.launchers.push(launcher);
        state.children.insert(launcher, children);
        if let ChildMode::Delayed(polls) = mode {
            state.pending.insert(launcher, polls);
        }
        Ok(launcher)
    }

    async fn resolve_child(&self, launcher: ProcessId) -> Result<ProcessId, SupervisorError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if *self.mode.lock().unwrap() == ChildMode::EnumerateFails {
            return Err(SupervisorError::Enumerate("mock process table".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        if let Some(left) = state.pending.get_mut(&launcher)
            && *left > 0
        {
            *left -= 1;
            return Err(SupervisorError::NoDescendant { launcher });
        }

        match state.children.get(&launcher).map(Vec::as_slice) {
            Some([worker]) => Ok(*worker),
            Some([]) | None => Err(SupervisorError::NoDescendant { launcher }),
            Some(many) => Err(SupervisorError::AmbiguousDescendants {
                launcher,
                count: many.len(),
            }),
        }
    }

    fn kill(&self, pid: ProcessId) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(pid);
        if state.kill_failures.contains(&pid) {
            return Err(SupervisorError::Kill {
                pid,
                reason: "mock permission denied".to_string(),
            });
        }
        Ok(())
    }

    fn kill_tree(&self, launcher: ProcessId) -> Result<(), SupervisorError> {
        self.state.lock().unwrap().killed_trees.push(launcher);
        Ok(())
    }
}

/// Present in `/proc` and not a zombie.
#[cfg(target_os = "linux")]
pub(crate) fn is_running(pid: ProcessId) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            Some(!rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

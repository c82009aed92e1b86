//! Process supervision - spawning launchers, walking the process tree, and
//! terminating workers.
//!
//! A worker is never started directly. The supervisor spawns a launcher shell
//! which in turn starts the worker executable, so the pid we get back from
//! `spawn` is the launcher's. The worker's own pid has to be discovered
//! afterwards by looking for the launcher's descendant in the process table.
//!
//! `ProcessSupervisor` is the seam: `OsSupervisor` talks to the real OS,
//! tests substitute a mock.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// OS process identity.
///
/// Zero is never a live process; it only appears in the "no capacity" reply.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const NONE: ProcessId = ProcessId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to start: the worker executable and the port it must listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub port: u16,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            program: program.into(),
            port,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn launcher: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("launcher exited before its pid could be read")]
    LauncherExited,
    #[error("launcher {launcher} has no descendant process yet")]
    NoDescendant { launcher: ProcessId },
    #[error("launcher {launcher} has {count} descendant processes, expected exactly one")]
    AmbiguousDescendants { launcher: ProcessId, count: usize },
    #[error("failed to enumerate process tree: {0}")]
    Enumerate(String),
    #[error("process {0} does not exist")]
    NotFound(ProcessId),
    #[error("failed to terminate process {pid}: {reason}")]
    Kill { pid: ProcessId, reason: String },
    #[error("process termination is not supported on this platform")]
    Unsupported,
}

/// Capability for starting, identifying, and stopping worker processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start the launcher for `command`. Returns the launcher's identity.
    async fn spawn(&self, command: &LaunchCommand) -> Result<ProcessId, SupervisorError>;

    /// Find the single descendant of `launcher`.
    ///
    /// Returns `NoDescendant` while the worker has not appeared yet; callers
    /// decide how long to keep asking.
    async fn resolve_child(&self, launcher: ProcessId) -> Result<ProcessId, SupervisorError>;

    /// Ask `pid` to terminate.
    fn kill(&self, pid: ProcessId) -> Result<(), SupervisorError>;

    /// Terminate `launcher` together with everything it started.
    fn kill_tree(&self, launcher: ProcessId) -> Result<(), SupervisorError>;
}

/// Runs `"$0" "$1"` and then exits with its status. The trailing `exit`
/// keeps the shell from exec-replacing itself with the worker.
const LAUNCH_SCRIPT: &str = r#""$0" "$1"; exit $?"#;

/// Supervisor backed by real OS processes.
pub struct OsSupervisor {
    shell: String,
}

impl OsSupervisor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for OsSupervisor {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl ProcessSupervisor for OsSupervisor {
    async fn spawn(&self, command: &LaunchCommand) -> Result<ProcessId, SupervisorError> {
        let port = command.port;
        tracing::trace!(shell = %self.shell, program = %command.program.display(), port, "spawn");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(LAUNCH_SCRIPT)
            .arg(&command.program)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Launcher leads its own group so the whole tree can be signalled.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;

        let launcher = child
            .id()
            .map(ProcessId::new)
            .ok_or(SupervisorError::LauncherExited)?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, port, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, port, "stderr"));
        }

        // Reap the launcher so it does not linger as a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(port, launcher = %launcher, %status, "Launcher exited")
                }
                Err(e) => {
                    tracing::warn!(
                        port,
                        launcher = %launcher,
                        error = %e,
                        "Failed to wait for launcher"
                    )
                }
            }
        });

        Ok(launcher)
    }

    async fn resolve_child(&self, launcher: ProcessId) -> Result<ProcessId, SupervisorError> {
        let table = process_table().await?;
        single_descendant(&table, launcher)
    }

    #[cfg(unix)]
    fn kill(&self, pid: ProcessId) -> Result<(), SupervisorError> {
        send_sigterm(pid, |target, signal| nix::sys::signal::kill(target, signal))
    }

    #[cfg(unix)]
    fn kill_tree(&self, launcher: ProcessId) -> Result<(), SupervisorError> {
        send_sigterm(launcher, |group, signal| nix::sys::signal::killpg(group, signal))
    }

    #[cfg(not(unix))]
    fn kill(&self, _pid: ProcessId) -> Result<(), SupervisorError> {
        Err(SupervisorError::Unsupported)
    }

    #[cfg(not(unix))]
    fn kill_tree(&self, _launcher: ProcessId) -> Result<(), SupervisorError> {
        Err(SupervisorError::Unsupported)
    }
}

#[cfg(unix)]
fn send_sigterm<F>(pid: ProcessId, send: F) -> Result<(), SupervisorError>
where
    F: FnOnce(nix::unistd::Pid, nix::sys::signal::Signal) -> nix::Result<()>,
{
    use nix::errno::Errno;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    // 0 and negative values address process groups, never a single target.
    let raw = match i32::try_from(pid.as_u32()) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(SupervisorError::NotFound(pid)),
    };

    match send(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(SupervisorError::NotFound(pid)),
        Err(e) => Err(SupervisorError::Kill {
            pid,
            reason: e.to_string(),
        }),
    }
}

async fn forward_output<R>(reader: R, port: u16, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "enginepool::worker", port, stream, "{}", line);
    }
}

/// (pid, parent pid) pairs for every visible process.
pub(crate) type ProcessTable = Vec<(ProcessId, ProcessId)>;

#[cfg(target_os = "linux")]
pub(crate) async fn process_table() -> Result<ProcessTable, SupervisorError> {
    tokio::task::spawn_blocking(|| read_proc_table(Path::new("/proc")))
        .await
        .map_err(|e| SupervisorError::Enumerate(e.to_string()))?
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn process_table() -> Result<ProcessTable, SupervisorError> {
    let output = Command::new("ps")
        .args(["-A", "-o", "pid=,ppid="])
        .output()
        .await
        .map_err(|e| SupervisorError::Enumerate(format!("ps: {e}")))?;
    if !output.status.success() {
        return Err(SupervisorError::Enumerate(format!(
            "ps exited with {}",
            output.status
        )));
    }
    Ok(parse_ps_table(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn read_proc_table(proc_root: &Path) -> Result<ProcessTable, SupervisorError> {
    let entries = std::fs::read_dir(proc_root)
        .map_err(|e| SupervisorError::Enumerate(format!("{}: {e}", proc_root.display())))?;

    let mut table = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // The process may have exited since readdir.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_stat_ppid(&stat) {
            table.push((ProcessId(pid), ppid));
        }
    }
    Ok(table)
}

/// Parent pid from a `/proc/<pid>/stat` line.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_ppid(stat: &str) -> Option<ProcessId> {
    // comm is parenthesised and may itself contain spaces or ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok().map(ProcessId)
}

#[cfg_attr(target_os = "linux", allow(dead_code))]
fn parse_ps_table(output: &str) -> ProcessTable {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((ProcessId(pid), ProcessId(ppid)))
        })
        .collect()
}

/// All transitive descendants of `root`, breadth first.
pub(crate) fn descendants(table: &[(ProcessId, ProcessId)], root: ProcessId) -> Vec<ProcessId> {
    let mut children: HashMap<ProcessId, Vec<ProcessId>> = HashMap::new();
    for &(pid, ppid) in table {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        if let Some(kids) = children.get(&parent) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    frontier.push(kid);
                }
            }
        }
    }
    found
}

fn single_descendant(
    table: &[(ProcessId, ProcessId)],
    launcher: ProcessId,
) -> Result<ProcessId, SupervisorError> {
    match descendants(table, launcher).as_slice() {
        [worker] => Ok(*worker),
        [] => Err(SupervisorError::NoDescendant { launcher }),
        many => Err(SupervisorError::AmbiguousDescendants {
            launcher,
            count: many.len(),
        }),
    }
}

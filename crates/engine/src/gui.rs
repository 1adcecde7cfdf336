//! Headless runs of GUI-only tools.
//!
//! Each run gets its own virtual display server on a leased display number.
//! Both the server and the tool are started in their own process groups so a
//! memory watchdog can take down everything they spawned.

use crate::display::{DisplayAllocator, DisplayLease};
use crate::tools::{describe, exit_code};
use std::collections::HashMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";
const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_START_ATTEMPTS: u32 = 3;
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Exit code reported when the tool could not be started at all
pub const LAUNCH_FAILED: i32 = -1;

/// Outcome of one headless run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuiRun {
    pub exit_code: i32,
    /// The watchdog killed the run for exceeding its memory budget
    pub killed_for_memory: bool,
}

impl GuiRun {
    fn launch_failed() -> Self {
        Self {
            exit_code: LAUNCH_FAILED,
            killed_for_memory: false,
        }
    }
}

/// A running display server bound to a leased display number
struct DisplayServer {
    child: Child,
    lease: DisplayLease,
}

impl DisplayServer {
    fn start(program: &str, lease: DisplayLease) -> io::Result<Self> {
        let child = Command::new(program)
            .arg(lease.display_var())
            .args(["-screen", "0", "1280x720x24", "-nolisten", "tcp"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        let mut server = Self { child, lease };
        match server.wait_ready() {
            Ok(true) => Ok(server),
            Ok(false) => {
                server.stop();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("display server on :{} did not come up", server.lease.id()),
                ))
            }
            Err(e) => {
                server.stop();
                Err(e)
            }
        }
    }

    fn socket(&self) -> PathBuf {
        PathBuf::from(X11_SOCKET_DIR).join(format!("X{}", self.lease.id()))
    }

    /// Wait for the server's socket; false if it exits or times out first
    fn wait_ready(&mut self) -> io::Result<bool> {
        let deadline = Instant::now() + SERVER_READY_TIMEOUT;
        let socket = self.socket();
        while Instant::now() < deadline {
            if socket.exists() {
                return Ok(true);
            }
            if self.child.try_wait()?.is_some() {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(50));
        }
        Ok(false)
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn stop(&mut self) {
        kill_group(self.child.id());
        let _ = self.child.wait();
    }
}

/// SIGTERM a whole process group led by `pgid`
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a stale group id yields ESRCH
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
}

/// Resident memory of every process descending from (or equal to) a root.
///
/// `processes` maps pid to (parent pid, resident bytes).
fn tree_memory(processes: &HashMap<u32, (Option<u32>, u64)>, roots: &[u32]) -> u64 {
    let in_tree = |mut pid: u32| {
        // Parent chains are short; the bound guards against pid reuse cycles
        for _ in 0..64 {
            if roots.contains(&pid) {
                return true;
            }
            match processes.get(&pid).and_then(|(parent, _)| *parent) {
                Some(parent) => pid = parent,
                None => return false,
            }
        }
        false
    };
    processes
        .iter()
        .filter(|(pid, _)| in_tree(**pid))
        .map(|(_, (_, memory))| *memory)
        .sum()
}

fn process_snapshot() -> HashMap<u32, (Option<u32>, u64)> {
    use sysinfo::{ProcessRefreshKind, RefreshKind, System};

    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
    );
    sys.processes()
        .iter()
        .map(|(pid, process)| {
            (
                pid.as_u32(),
                (process.parent().map(|p| p.as_u32()), process.memory()),
            )
        })
        .collect()
}

/// Poll the trees once per interval until told to stop; kill both groups
/// when their combined memory exceeds `budget_bytes`.
fn watchdog(roots: [u32; 2], budget_bytes: u64, stop: mpsc::Receiver<()>) -> bool {
    loop {
        match stop.recv_timeout(WATCHDOG_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => return false,
        }
        let used = tree_memory(&process_snapshot(), &roots);
        if used > budget_bytes {
            tracing::warn!(
                used_gb = used as f64 / BYTES_PER_GB,
                budget_gb = budget_bytes as f64 / BYTES_PER_GB,
                "Memory budget exceeded, terminating GUI tool"
            );
            for pgid in roots {
                kill_group(pgid);
            }
            return true;
        }
    }
}

fn start_server(program: &str, allocator: &Arc<DisplayAllocator>) -> Option<DisplayServer> {
    for attempt in 1..=SERVER_START_ATTEMPTS {
        let lease = allocator.acquire();
        let display_id = lease.id();
        match DisplayServer::start(program, lease) {
            Ok(server) => return Some(server),
            Err(e) => {
                tracing::warn!(display_id, attempt, error = %e, "Display server failed to start");
                if e.kind() == io::ErrorKind::NotFound {
                    return None;
                }
            }
        }
    }
    None
}

/// Run `cmd` against a private virtual display.
///
/// Returns the tool's exit code (`128 + signal` when killed), or
/// [`LAUNCH_FAILED`] when the display server or the tool could not start. A
/// non-positive budget disables the memory watchdog. The display is released
/// when the call returns.
pub fn run_with_display(
    server_program: &str,
    allocator: &Arc<DisplayAllocator>,
    mut cmd: Command,
    memory_budget_gb: f32,
) -> GuiRun {
    let Some(mut server) = start_server(server_program, allocator) else {
        return GuiRun::launch_failed();
    };

    let command = describe(&cmd);
    tracing::debug!(display_id = server.lease.id(), %command, "Starting GUI tool");
    let mut child = match cmd
        .env("DISPLAY", server.lease.display_var())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(%command, error = %e, "Failed to launch GUI tool");
            server.stop();
            return GuiRun::launch_failed();
        }
    };

    let (stop_tx, stop_rx) = mpsc::channel();
    let watchdog = if memory_budget_gb.is_finite() && memory_budget_gb > 0.0 {
        let budget = (memory_budget_gb as f64 * BYTES_PER_GB) as u64;
        let roots = [child.id(), server.pid()];
        Some(thread::spawn(move || watchdog(roots, budget, stop_rx)))
    } else {
        None
    };

    let status = child.wait();
    let _ = stop_tx.send(());
    let killed_for_memory = watchdog
        .map(|handle| handle.join().unwrap_or(false))
        .unwrap_or(false);
    server.stop();

    match status {
        Ok(status) => GuiRun {
            exit_code: exit_code(&status),
            killed_for_memory,
        },
        Err(e) => {
            tracing::error!(%command, error = %e, "Failed to wait for GUI tool");
            GuiRun {
                exit_code: LAUNCH_FAILED,
                killed_for_memory,
            }
        }
    }
}

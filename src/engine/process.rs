//! Process Supervisor
//!
//! Finds, signals, and waits on the worker process by executable name, and
//! launches new processes. Termination is graceful-then-forced: a polite
//! signal, a bounded wait, then a forced kill. All waits poll the process
//! table on a fixed interval; nothing spins.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Extra wait after a forced kill before giving up on the pid.
const KILL_SETTLE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to terminate process {pid}")]
    TerminateFailed { pid: u32 },
    #[error("Failed to launch {path}: {source}")]
    LaunchFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct ProcessSupervisor {
    system: System,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Find all running processes whose executable name matches exactly.
    pub fn find_running(&mut self, exe_name: &str) -> Vec<u32> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        self.system
            .processes_by_exact_name(exe_name.as_ref())
            .map(|p| p.pid().as_u32())
            .collect()
    }

    /// Check whether a pid is still present in the process table.
    pub fn is_alive(&mut self, pid: u32) -> bool {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        self.system.process(Pid::from_u32(pid)).is_some()
    }

    /// Wait for a pid to leave the process table, bounded by `timeout`.
    /// Returns true if the process exited in time.
    pub fn wait_for_exit(&mut self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Terminate a process: graceful signal first, forced kill after the
    /// grace period elapses.
    pub fn terminate(&mut self, pid: u32, grace: Duration) -> Result<(), ProcessError> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let Some(process) = self.system.process(Pid::from_u32(pid)) else {
            debug!(pid, "process already gone");
            return Ok(());
        };

        // SIGTERM where the platform supports it; kill_with returns None
        // when it does not, in which case we go straight to the hard kill.
        let asked_nicely = process.kill_with(Signal::Term).unwrap_or(false);
        if asked_nicely {
            info!(pid, "sent terminate signal");
            if self.wait_for_exit(pid, grace) {
                return Ok(());
            }
            warn!(pid, grace_secs = grace.as_secs(), "grace period elapsed, killing");
        }

        self.system.refresh_processes(ProcessesToUpdate::All, true);
        if let Some(process) = self.system.process(Pid::from_u32(pid)) {
            process.kill();
        }
        if self.wait_for_exit(pid, KILL_SETTLE) {
            Ok(())
        } else {
            Err(ProcessError::TerminateFailed { pid })
        }
    }

    /// Terminate every running instance of an executable. Failures on
    /// individual pids are collected into one error after all attempts.
    pub fn terminate_all(&mut self, exe_name: &str, grace: Duration) -> Result<usize, ProcessError> {
        let pids = self.find_running(exe_name);
        if pids.is_empty() {
            debug!(exe_name, "no running instances");
            return Ok(0);
        }

        info!(exe_name, count = pids.len(), "stopping running instances");
        let mut failed = None;
        for pid in &pids {
            if let Err(e) = self.terminate(*pid, grace) {
                failed = Some(e);
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(pids.len()),
        }
    }

    /// Launch an executable. Detached children get their own process group
    /// (unix) or `DETACHED_PROCESS` (windows) so they survive this process
    /// exiting; stdio is disconnected either way.
    pub fn launch(path: &Path, args: &[String], detached: bool) -> Result<u32, ProcessError> {
        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = path.parent() {
            command.current_dir(dir);
        }

        if detached {
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(0);
            }
            #[cfg(windows)]
            {
                use std::os::windows::process::CommandExt;
                const DETACHED_PROCESS: u32 = 0x0000_0008;
                const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
                command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
            }
        }

        let child = command.spawn().map_err(|source| ProcessError::LaunchFailed {
            path: path.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(path = %path.display(), pid, detached, "launched process");
        Ok(pid)
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_running_unknown_name() {
        let mut supervisor = ProcessSupervisor::new();
        let pids = supervisor.find_running("definitely-not-a-real-process-name");
        assert!(pids.is_empty());
    }

    #[test]
    fn test_wait_for_exit_on_dead_pid() {
        let mut supervisor = ProcessSupervisor::new();
        // Spawn a short-lived child and wait for it to be reaped
        let mut child = Command::new(if cfg!(windows) { "cmd" } else { "true" })
            .args(if cfg!(windows) { vec!["/C", "exit"] } else { vec![] })
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(supervisor.wait_for_exit(pid, Duration::from_secs(10)));
    }

    #[test]
    fn test_terminate_missing_pid_is_ok() {
        let mut supervisor = ProcessSupervisor::new();
        // Pids near u32::MAX do not exist on any sane system
        assert!(supervisor.terminate(u32::MAX - 7, Duration::from_secs(1)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_running_process() {
        // Orphan the sleep so it is not our zombie child after the kill
        let output = Command::new("sh")
            .arg("-c")
            .arg("sleep 60 >/dev/null 2>&1 & echo $!")
            .output()
            .unwrap();
        let pid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();

        let mut supervisor = ProcessSupervisor::new();
        assert!(supervisor.is_alive(pid));
        supervisor.terminate(pid, Duration::from_secs(5)).unwrap();
        assert!(!supervisor.is_alive(pid));
    }

    #[test]
    fn test_launch_missing_executable_fails() {
        let result = ProcessSupervisor::launch(
            Path::new("/nonexistent/forgeworker"),
            &["--token".to_string(), "x".to_string()],
            false,
        );
        assert!(matches!(result, Err(ProcessError::LaunchFailed { .. })));
    }
}

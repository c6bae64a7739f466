//! Executable Handoff
//!
//! The file-swap procedure run by `forgeman-handoff` after the manager
//! downloads its own replacement. It runs in a process the manager spawned
//! detached, so the manager's executable can be overwritten once its process
//! is confirmed gone. The two processes communicate only through the
//! filesystem and the process table.
//!
//! Ordering matters: nothing is written until the manager pid has left the
//! process table. A wait timeout aborts the handoff with both old files left
//! in place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::archive::{extract_zip, ArchiveError};
use super::process::{ProcessError, ProcessSupervisor};

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Timed out waiting for process {pid} to exit")]
    Timeout { pid: u32 },
    #[error("Update archive not found: {0}")]
    ArchiveMissing(PathBuf),
    #[error("Install directory not found: {0}")]
    InstallDirMissing(PathBuf),
    #[error("Failed to extract update: {0}")]
    Extract(#[from] ArchiveError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to restart manager: {0}")]
    Restart(#[from] ProcessError),
}

/// Everything the handoff executor needs, passed on its command line.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    /// Manager process to wait out before touching any file.
    pub manager_pid: u32,
    /// Downloaded release archive to extract over the install dir.
    pub archive: PathBuf,
    pub install_dir: PathBuf,
    /// Executable to relaunch once the swap is done.
    pub manager_exe: String,
    pub wait_timeout: Duration,
}

/// Perform the swap: wait for the manager to exit, back up the install
/// directory, extract the new version over it, restart the manager, clean
/// up. Restores the backup if extraction fails partway.
pub fn execute(request: &HandoffRequest) -> Result<(), HandoffError> {
    if !request.archive.exists() {
        return Err(HandoffError::ArchiveMissing(request.archive.clone()));
    }
    if !request.install_dir.exists() {
        return Err(HandoffError::InstallDirMissing(request.install_dir.clone()));
    }

    let mut supervisor = ProcessSupervisor::new();
    info!(pid = request.manager_pid, "waiting for manager to exit");
    if !supervisor.wait_for_exit(request.manager_pid, request.wait_timeout) {
        // The old executable may still be mapped; overwriting now could
        // corrupt a running process. Leave everything in place.
        return Err(HandoffError::Timeout {
            pid: request.manager_pid,
        });
    }

    let backup_dir = backup_path(&request.install_dir);
    create_backup(&request.install_dir, &backup_dir)?;

    match extract_zip(&request.archive, &request.install_dir) {
        Ok(written) => info!(files = written, "new version extracted"),
        Err(e) => {
            warn!(error = %e, "extraction failed, restoring backup");
            restore_backup(&backup_dir, &request.install_dir)?;
            return Err(e.into());
        }
    }

    let exe_path = request.install_dir.join(&request.manager_exe);
    ProcessSupervisor::launch(&exe_path, &[], true)?;
    info!(exe = %exe_path.display(), "manager restarted");

    // Best-effort cleanup; a leftover archive or backup is harmless
    let _ = std::fs::remove_file(&request.archive);
    let _ = std::fs::remove_dir_all(&backup_dir);
    Ok(())
}

fn backup_path(install_dir: &Path) -> PathBuf {
    let name = install_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "install".to_string());
    install_dir.with_file_name(format!("{}_backup", name))
}

fn create_backup(install_dir: &Path, backup_dir: &Path) -> std::io::Result<()> {
    if backup_dir.exists() {
        std::fs::remove_dir_all(backup_dir)?;
    }
    copy_dir(install_dir, backup_dir)
}

fn restore_backup(backup_dir: &Path, install_dir: &Path) -> std::io::Result<()> {
    if install_dir.exists() {
        std::fs::remove_dir_all(install_dir)?;
    }
    copy_dir(backup_dir, install_dir)
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

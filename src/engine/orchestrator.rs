//! Update Orchestrator
//!
//! The state machine that ties the release client, token authority, and
//! process supervisor together: keep the manager current, keep the worker
//! current, then launch the worker behind a fresh single-use token.
//!
//! Self-update failures never block the worker path; the worker launch
//! failing is the only fatal outcome of a normal run. The machine runs on a
//! single control thread and reports progress through an mpsc channel so the
//! presentation layer never blocks it.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::archive::extract_zip;
use super::config::AppConfig;
use super::process::{ProcessError, ProcessSupervisor};
use super::release::{Release, ReleaseAsset, ReleaseChannel, ReleaseError};
use super::token::{TokenAuthority, TokenError};
use super::version::{is_newer, Version};

const INSTALLED_VERSION_FILE: &str = "installed_version.json";

/// States of the update-and-launch machine.
///
/// Terminal states are `Exited` (self-update handed off, this process ends)
/// and `Done` (worker launched, this process ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Idle,
    CheckingSelf,
    SelfUpToDate,
    DownloadingSelf,
    HandingOff,
    Exited,
    CheckingWorker,
    WorkerUpToDate,
    UpdatingWorker,
    IssuingToken,
    LaunchingWorker,
    Done,
}

/// Typed progress notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    State(ManagerState),
    Download {
        app: String,
        bytes: u64,
        total: Option<u64>,
    },
    Notice(String),
}

/// Terminal result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Self-update handed off to the external executor; caller exits now.
    HandedOff,
    /// Worker started with a fresh launch token.
    WorkerLaunched,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Failed to launch worker: {0}")]
    WorkerLaunch(#[from] ProcessError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Non-fatal failures inside the worker update cycle.
#[derive(Error, Debug)]
enum WorkerUpdateError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Archive(#[from] super::archive::ArchiveError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pure update decision from (local version, channel response). No side
/// effects; the artifact is resolved only when an update is called for.
#[derive(Debug, Clone)]
pub struct UpdateDecision {
    pub needs_update: bool,
    pub current: Option<Version>,
    pub remote: Version,
    pub artifact: Option<ReleaseAsset>,
}

impl UpdateDecision {
    pub fn decide(current: Option<Version>, release: &Release, asset_name: &str) -> Self {
        let needs_update = is_newer(current, release.version);
        let artifact = if needs_update {
            release.select_asset(asset_name).cloned()
        } else {
            None
        };
        Self {
            needs_update,
            current,
            remote: release.version,
            artifact,
        }
    }
}

/// Record of the worker version currently on disk.
#[derive(Debug, Serialize, Deserialize)]
struct InstalledVersion {
    app: String,
    version: Version,
    updated_at: String,
}

pub struct UpdateOrchestrator<'a> {
    config: &'a AppConfig,
    channel: &'a dyn ReleaseChannel,
    authority: &'a TokenAuthority,
    events: Sender<ProgressEvent>,
    supervisor: ProcessSupervisor,
    state: ManagerState,
    self_version: Version,
    handoff_exe: PathBuf,
    download_dir: PathBuf,
}

impl<'a> UpdateOrchestrator<'a> {
    pub fn new(
        config: &'a AppConfig,
        channel: &'a dyn ReleaseChannel,
        authority: &'a TokenAuthority,
        events: Sender<ProgressEvent>,
    ) -> Self {
        let handoff_exe = default_handoff_exe(config);
        Self {
            config,
            channel,
            authority,
            events,
            supervisor: ProcessSupervisor::new(),
            state: ManagerState::Idle,
            self_version: Version::current(),
            handoff_exe,
            download_dir: std::env::temp_dir().join("forgeman"),
        }
    }

    /// Override the version this process considers itself to be (testing).
    pub fn with_self_version(mut self, version: Version) -> Self {
        self.self_version = version;
        self
    }

    /// Override the handoff executor path (testing).
    pub fn with_handoff_exe(mut self, path: PathBuf) -> Self {
        self.handoff_exe = path;
        self
    }

    /// Override where downloads land (testing).
    pub fn with_download_dir(mut self, dir: PathBuf) -> Self {
        self.download_dir = dir;
        self
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    fn set_state(&mut self, state: ManagerState) {
        self.state = state;
        let _ = self.events.send(ProgressEvent::State(state));
    }

    fn notice(&self, message: String) {
        let _ = self.events.send(ProgressEvent::Notice(message));
    }

    /// Drive the machine to a terminal state.
    pub fn run(&mut self) -> Result<RunOutcome, OrchestratorError> {
        if self.try_self_update() {
            self.set_state(ManagerState::Exited);
            return Ok(RunOutcome::HandedOff);
        }

        self.update_worker();

        self.set_state(ManagerState::IssuingToken);
        let subject = self.config.layout.worker_exe.clone();
        let token = self.authority.issue_launch_token(&subject)?;

        self.set_state(ManagerState::LaunchingWorker);
        let worker_path = self.config.worker_exe_path();
        ProcessSupervisor::launch(
            &worker_path,
            &["--token".to_string(), token],
            true,
        )?;

        self.set_state(ManagerState::Done);
        Ok(RunOutcome::WorkerLaunched)
    }

    /// Self-update check. Returns true when a handoff was started and this
    /// process must exit; every failure falls through to the worker path.
    fn try_self_update(&mut self) -> bool {
        self.set_state(ManagerState::CheckingSelf);

        let release = match self.channel.latest_release(&self.config.channel.manager_repo) {
            Ok(release) => release,
            Err(e) => {
                // Best-effort: serve the worker even when the channel is down
                warn!(error = %e, "self-update check failed, continuing");
                self.notice(format!("Self-update check failed: {}", e));
                self.set_state(ManagerState::SelfUpToDate);
                return false;
            }
        };

        let asset_name = self.config.asset_name("forgeman");
        let decision = UpdateDecision::decide(Some(self.self_version), &release, &asset_name);
        if !decision.needs_update {
            info!(version = %self.self_version, "manager is up to date");
            self.set_state(ManagerState::SelfUpToDate);
            return false;
        }
        let Some(artifact) = decision.artifact else {
            warn!(tag = %release.tag, asset = %asset_name, "release has no matching asset");
            self.set_state(ManagerState::SelfUpToDate);
            return false;
        };

        info!(current = %self.self_version, remote = %decision.remote, "manager update available");
        self.set_state(ManagerState::DownloadingSelf);
        let dest = self.download_dir.join(&artifact.name);
        if let Err(e) = self.download(&artifact, &dest, "forgeman") {
            // A partial self-update is never handed off
            warn!(error = %e, "self-update download failed, continuing");
            self.notice(format!("Self-update download failed: {}", e));
            return false;
        }

        self.set_state(ManagerState::HandingOff);
        match self.spawn_handoff(&dest) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "could not start handoff executor, continuing");
                self.notice(format!("Self-update handoff failed: {}", e));
                false
            }
        }
    }

    /// Launch the handoff executor detached and give it everything it needs:
    /// our pid to wait on, the archive, and where to put it.
    fn spawn_handoff(&self, archive: &Path) -> Result<(), ProcessError> {
        let args = vec![
            std::process::id().to_string(),
            archive.display().to_string(),
            self.config.layout.install_dir.display().to_string(),
            self.config.layout.manager_exe.clone(),
            self.config.timeouts.handoff_wait_secs.to_string(),
        ];
        ProcessSupervisor::launch(&self.handoff_exe, &args, true)?;
        info!(executor = %self.handoff_exe.display(), "handoff started, exiting");
        Ok(())
    }

    /// Worker update cycle. Never fatal: whatever worker binary is on disk
    /// after this returns is what gets launched.
    fn update_worker(&mut self) {
        self.set_state(ManagerState::CheckingWorker);

        let release = match self.channel.latest_release(&self.config.channel.worker_repo) {
            Ok(release) => release,
            Err(e) => {
                warn!(error = %e, "worker update check failed, using installed worker");
                self.notice(format!("Worker update check failed: {}", e));
                self.set_state(ManagerState::WorkerUpToDate);
                return;
            }
        };

        let installed = self.installed_worker_version();
        let asset_name = self.config.asset_name("forgeworker");
        let decision = UpdateDecision::decide(installed, &release, &asset_name);
        if !decision.needs_update {
            info!("worker is up to date");
            self.set_state(ManagerState::WorkerUpToDate);
            return;
        }
        let Some(artifact) = decision.artifact.clone() else {
            warn!(tag = %release.tag, asset = %asset_name, "worker release has no matching asset");
            self.set_state(ManagerState::WorkerUpToDate);
            return;
        };

        info!(
            current = ?decision.current,
            remote = %decision.remote,
            "worker update available"
        );
        self.set_state(ManagerState::UpdatingWorker);
        if let Err(e) = self.install_worker(&artifact, decision.remote) {
            warn!(error = %e, "worker update failed, using installed worker");
            self.notice(format!("Worker update failed: {}", e));
        }
    }

    /// Stop running instances, download and verify, extract in place,
    /// record the installed version.
    fn install_worker(
        &mut self,
        artifact: &ReleaseAsset,
        version: Version,
    ) -> Result<(), WorkerUpdateError> {
        let grace = Duration::from_secs(self.config.timeouts.terminate_grace_secs);
        let worker_exe = self.config.layout.worker_exe.clone();
        self.supervisor.terminate_all(&worker_exe, grace)?;

        let dest = self.download_dir.join(&artifact.name);
        self.download(artifact, &dest, "forgeworker")?;

        let written = extract_zip(&dest, &self.config.layout.install_dir)?;
        let _ = std::fs::remove_file(&dest);
        info!(files = written, version = %version, "worker updated");

        self.record_worker_version(version)?;
        Ok(())
    }

    fn download(
        &self,
        artifact: &ReleaseAsset,
        dest: &Path,
        app: &str,
    ) -> Result<(), ReleaseError> {
        let events = self.events.clone();
        let app_name = app.to_string();
        self.channel.download_asset(artifact, dest, &mut |bytes, total| {
            let _ = events.send(ProgressEvent::Download {
                app: app_name.clone(),
                bytes,
                total,
            });
        })
    }

    fn installed_worker_version(&self) -> Option<Version> {
        let path = self.config.layout.install_dir.join(INSTALLED_VERSION_FILE);
        let content = std::fs::read_to_string(path).ok()?;
        let record: InstalledVersion = serde_json::from_str(&content).ok()?;
        Some(record.version)
    }

    fn record_worker_version(&self, version: Version) -> std::io::Result<()> {
        let record = InstalledVersion {
            app: "forgeworker".to_string(),
            version,
            updated_at: Utc::now().to_rfc3339(),
        };
        let path = self.config.layout.install_dir.join(INSTALLED_VERSION_FILE);
        std::fs::write(path, serde_json::to_string_pretty(&record)?)
    }
}

/// The handoff executor is expected beside the running manager binary, with
/// the install dir as fallback.
fn default_handoff_exe(config: &AppConfig) -> PathBuf {
    let name = if cfg!(windows) {
        "forgeman-handoff.exe"
    } else {
        "forgeman-handoff"
    };
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let candidate = dir.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    config.layout.install_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(tag: &str, assets: &[&str]) -> Release {
        Release {
            version: Version::parse_tag(tag).unwrap(),
            tag: tag.to_string(),
            assets: assets
                .iter()
                .map(|name| ReleaseAsset {
                    name: name.to_string(),
                    download_url: format!("https://example.com/{}", name),
                    size: None,
                    sha256: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_decide_update_needed() {
        let rel = release("v1.3.0", &["forgeman_linux.zip"]);
        let decision =
            UpdateDecision::decide(Some(Version::new(1, 2, 0)), &rel, "forgeman_linux.zip");
        assert!(decision.needs_update);
        assert_eq!(decision.remote, Version::new(1, 3, 0));
        assert!(decision.artifact.is_some());
    }

    #[test]
    fn test_decide_up_to_date_resolves_no_artifact() {
        let rel = release("v1.3.0", &["forgeman_linux.zip"]);
        let decision =
            UpdateDecision::decide(Some(Version::new(1, 3, 0)), &rel, "forgeman_linux.zip");
        assert!(!decision.needs_update);
        assert!(decision.artifact.is_none());
    }

    #[test]
    fn test_decide_no_prior_version_updates() {
        let rel = release("v0.0.1", &["forgeworker_linux.zip"]);
        let decision = UpdateDecision::decide(None, &rel, "forgeworker_linux.zip");
        assert!(decision.needs_update);
        assert!(decision.current.is_none());
    }

    #[test]
    fn test_decide_update_with_missing_asset() {
        let rel = release("v2.0.0", &["other_windows.zip"]);
        let decision =
            UpdateDecision::decide(Some(Version::new(1, 0, 0)), &rel, "forgeman_linux.zip");
        assert!(decision.needs_update);
        assert!(decision.artifact.is_none());
    }
}

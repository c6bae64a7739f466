//! Forgeman Handoff Executor
//!
//! A tiny detached process that replaces the manager executable after the
//! manager exits, then restarts it. It never updates itself and never shares
//! the manager's process lifetime - the manager spawns it detached and exits
//! immediately.
//!
//! ## Responsibilities
//! 1. Wait (bounded) for the manager pid to leave the process table
//! 2. Extract the downloaded release archive over the install directory
//! 3. Restart the new manager executable
//!
//! Usage: forgeman-handoff <manager-pid> <archive> <install-dir> <manager-exe> [wait-secs]

use std::process::ExitCode;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use forgeman_lib::engine::handoff::{execute, HandoffError, HandoffRequest};
use forgeman_lib::exit_codes;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(request) = parse_args() else {
        eprintln!(
            "Usage: forgeman-handoff <manager-pid> <archive> <install-dir> <manager-exe> [wait-secs]"
        );
        return ExitCode::FAILURE;
    };

    match execute(&request) {
        Ok(()) => ExitCode::from(exit_codes::OK),
        Err(HandoffError::Timeout { pid }) => {
            // The manager never exited; overwriting its executable now would
            // risk corrupting a running process. Both old files stay in place.
            eprintln!("Error: manager process {} did not exit in time", pid);
            ExitCode::from(exit_codes::HANDOFF_TIMEOUT)
        }
        Err(e) => {
            eprintln!("Error: handoff failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_args() -> Option<HandoffRequest> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 || args.len() > 5 {
        return None;
    }

    let manager_pid: u32 = args[0].parse().ok()?;
    let wait_secs: u64 = match args.get(4) {
        Some(raw) => raw.parse().ok()?,
        None => 30,
    };

    Some(HandoffRequest {
        manager_pid,
        archive: args[1].clone().into(),
        install_dir: args[2].clone().into(),
        manager_exe: args[3].clone(),
        wait_timeout: Duration::from_secs(wait_secs),
    })
}

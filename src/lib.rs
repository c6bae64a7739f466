//! Forgeman - Self-updating release manager and launcher for Forgeworker
//! Library crate shared by the `forgeman` and `forgeman-handoff` binaries.

pub mod engine;

/// Process exit codes shared by both binaries.
pub mod exit_codes {
    /// Successful completion of either terminal state.
    pub const OK: u8 = 0;
    /// The worker failed to start.
    pub const WORKER_LAUNCH_FAILED: u8 = 12;
    /// The handoff executor timed out waiting for the manager to exit.
    pub const HANDOFF_TIMEOUT: u8 = 13;
    /// An invalid token was presented at startup.
    pub const INVALID_TOKEN: u8 = 14;
}

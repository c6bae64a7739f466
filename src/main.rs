//! Forgeman manager entry point
//!
//! A plain start runs the update-and-launch cycle: refresh the manager
//! itself, refresh the worker, then start the worker behind a single-use
//! launch token. A valid developer token on the command line unlocks the
//! developer operations instead.

use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use forgeman_lib::engine::config::AppConfig;
use forgeman_lib::engine::orchestrator::{
    OrchestratorError, ProgressEvent, RunOutcome, UpdateOrchestrator,
};
use forgeman_lib::engine::release::ReleaseClient;
use forgeman_lib::engine::secrets::{SecretCipher, SecretStore, RELEASE_TOKEN};
use forgeman_lib::engine::token::TokenAuthority;
use forgeman_lib::exit_codes;

#[derive(Parser, Debug)]
#[command(name = "forgeman")]
#[command(author = "Forgeman Team")]
#[command(version)]
#[command(about = "Self-updating release manager and launcher for Forgeworker", long_about = None)]
struct Cli {
    /// Developer token unlocking the developer operations
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the update-and-launch cycle (the default)
    Run,

    /// Developer operations (gated by --token)
    Dev {
        #[command(subcommand)]
        action: DevAction,
    },
}

#[derive(Subcommand, Debug)]
enum DevAction {
    /// Mint a developer token from the local keypair
    IssueToken {
        /// Role claim carried by the token
        #[arg(long, default_value = "release-engineer")]
        role: String,
    },

    /// Encrypt a value for the bundled secret constants
    EncryptSecret {
        /// Plaintext to encrypt
        value: String,
    },

    /// Decode a developer token's claims
    TokenInfo {
        /// Token to decode
        value: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_dir = AppConfig::config_dir().context("resolving config directory")?;
    let config = AppConfig::load(&config_dir).context("loading configuration")?;
    let authority = TokenAuthority::open(&config_dir, &[config.layout.worker_exe.as_str()])
        .context("opening token authority")?;

    match cli.command {
        Some(Commands::Dev { action }) => dev_mode(&authority, cli.token, action),
        Some(Commands::Run) | None => match cli.token {
            // Presence of a developer token switches to the developer menu
            Some(token) => dev_menu(&authority, &token),
            None => update_and_launch(&config, &config_dir, &authority),
        },
    }
}

/// The normal path: self-update, worker update, token-gated launch.
fn update_and_launch(
    config: &AppConfig,
    config_dir: &std::path::Path,
    authority: &TokenAuthority,
) -> anyhow::Result<ExitCode> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting forgeman");

    let mut secrets = SecretStore::new(config_dir);
    let release_token = secrets.resolve(RELEASE_TOKEN);
    if release_token.is_none() {
        info!("no release credential available, using anonymous channel access");
    }

    let client = ReleaseClient::new(
        &config.channel.api_base,
        &config.channel.owner,
        release_token,
        Duration::from_secs(config.timeouts.http_timeout_secs),
        config.timeouts.max_retries,
    );

    let (events, progress) = mpsc::channel::<ProgressEvent>();
    let printer = std::thread::spawn(move || {
        for event in progress {
            match event {
                ProgressEvent::State(state) => println!(":: {:?}", state),
                ProgressEvent::Download { app, bytes, total } => {
                    if let Some(total) = total {
                        println!("   {} {}/{} bytes", app, bytes, total);
                    }
                }
                ProgressEvent::Notice(message) => println!("   {}", message),
            }
        }
    });

    let outcome = {
        let mut orchestrator = UpdateOrchestrator::new(config, &client, authority, events);
        orchestrator.run()
    };
    let _ = printer.join();

    match outcome {
        Ok(RunOutcome::HandedOff) => {
            info!("self-update in progress, exiting for handoff");
            Ok(ExitCode::from(exit_codes::OK))
        }
        Ok(RunOutcome::WorkerLaunched) => {
            info!("worker launched, exiting");
            Ok(ExitCode::from(exit_codes::OK))
        }
        Err(OrchestratorError::WorkerLaunch(e)) => {
            error!("worker did not start: {}", e);
            Ok(ExitCode::from(exit_codes::WORKER_LAUNCH_FAILED))
        }
        Err(e) => Err(e.into()),
    }
}

/// Interactive developer menu, shown when a valid developer token is passed
/// without a subcommand.
fn dev_menu(authority: &TokenAuthority, token: &str) -> anyhow::Result<ExitCode> {
    let claims = match authority.validate_developer_token(token) {
        Ok(claims) => claims,
        Err(e) => {
            error!("developer token rejected: {}", e);
            return Ok(ExitCode::from(exit_codes::INVALID_TOKEN));
        }
    };
    info!(role = %claims.role, "developer mode");

    loop {
        println!();
        println!("forgeman developer operations");
        println!("  1. Issue developer token");
        println!("  2. Encrypt bundled secret value");
        println!("  3. Exit");
        print!("Select option (1-3): ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut choice = String::new();
        if std::io::stdin().read_line(&mut choice)? == 0 {
            return Ok(ExitCode::from(exit_codes::OK));
        }
        match choice.trim() {
            "1" => println!("{}", authority.issue_developer_token(&claims.role)),
            "2" => {
                print!("Value to encrypt: ");
                std::io::stdout().flush()?;
                let mut value = String::new();
                std::io::stdin().read_line(&mut value)?;
                let cipher = SecretCipher::from_app_passphrase();
                println!("{}", cipher.encrypt(value.trim_end_matches(['\r', '\n'])));
            }
            "3" => return Ok(ExitCode::from(exit_codes::OK)),
            _ => println!("Invalid choice."),
        }
    }
}

/// Non-interactive developer actions.
fn dev_mode(
    authority: &TokenAuthority,
    token: Option<String>,
    action: DevAction,
) -> anyhow::Result<ExitCode> {
    // issue-token is the bootstrap path: it only needs the local keypair.
    // Everything else requires a valid developer token.
    if !matches!(action, DevAction::IssueToken { .. }) {
        let Some(token) = token else {
            error!("this action requires --token");
            return Ok(ExitCode::from(exit_codes::INVALID_TOKEN));
        };
        if let Err(e) = authority.validate_developer_token(&token) {
            error!("developer token rejected: {}", e);
            return Ok(ExitCode::from(exit_codes::INVALID_TOKEN));
        }
    }

    match action {
        DevAction::IssueToken { role } => {
            println!("{}", authority.issue_developer_token(&role));
        }
        DevAction::EncryptSecret { value } => {
            let cipher = SecretCipher::from_app_passphrase();
            println!("{}", cipher.encrypt(&value));
        }
        DevAction::TokenInfo { value } => {
            let claims = TokenAuthority::peek_developer_claims(&value)
                .context("token is not a developer token")?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
    }
    Ok(ExitCode::from(exit_codes::OK))
}

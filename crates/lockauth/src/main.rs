//! lockauth-auth - Unlock prompt for a locked screen.
//!
//! Runs one authentication session: spawns the privileged checking process
//! (`lockauth-authproto`), answers its prompts from the keyboard and exits
//! with the verdict.
//!
//! # Exit status
//!
//! - `0`: the user authenticated
//! - `1`: anything else (wrong password, cancelled, timed out, or an error)
//!
//! # Signals
//!
//! `SIGUSR1` kills the checking process and ends the session as denied.
//! `SIGTERM` does the same and terminates this process.

mod terminal;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use lockauth_core::prompt::MAX_TIMEOUT_SECS;
use lockauth_core::{
    install_signal_forwarding, Config, KeyboardInput, PromptEngine, SessionSupervisor, Verdict,
};

use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::terminal::{RawMode, TerminalRenderer};

/// Unlock prompt for a locked screen.
#[derive(Parser)]
#[command(name = "lockauth-auth")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file [default: ~/.config/lockauth/config.toml]
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the checking process (overrides the config file)
    #[arg(long, value_name = "PATH")]
    authproto: Option<PathBuf>,

    /// Prompt inactivity timeout in seconds (overrides the config file)
    #[arg(
        short,
        long,
        value_name = "SECONDS",
        value_parser = clap::value_parser!(u64).range(0..=MAX_TIMEOUT_SECS)
    )]
    timeout: Option<u64>,

    /// Increase log verbosity (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only show errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Log level from the CLI flags.
    ///
    /// Stderr doubles as the display, so only warnings are logged by default.
    fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            }
        }
    }
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // JOURNAL_STREAM is set when we run under systemd
    if std::env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(filter)
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration from specified path");
            Config::load_from(path).context("Failed to load configuration")
        }
        None => {
            let config = Config::load().context("Failed to load configuration")?;
            if let Some(path) = Config::default_path() {
                if path.exists() {
                    info!(path = %path.display(), "Loaded configuration");
                } else {
                    debug!("No config file found, using defaults");
                }
            }
            Ok(config)
        }
    }
}

fn run(cli: &Cli) -> Result<Verdict> {
    let mut config = load_config(cli)?;
    if let Some(seconds) = cli.timeout {
        config.prompt.timeout = seconds;
    }
    let executable = cli
        .authproto
        .clone()
        .unwrap_or_else(|| config.auth.authproto.clone());

    install_signal_forwarding().context("Failed to install signal handlers")?;

    let input = KeyboardInput::stdin().context("Failed to open keyboard input")?;
    let _raw = RawMode::enable(std::io::stdin()).context("Failed to configure terminal")?;

    let settings = config.prompt_settings();
    debug!(
        timeout = ?settings.timeout,
        display = %settings.password_display,
        alert_pause = ?settings.alert_pause,
        "Prompt settings"
    );
    let engine = PromptEngine::new(TerminalRenderer::stderr(), input, settings);

    info!(authproto = %executable.display(), "Starting authentication session");
    let mut supervisor = SessionSupervisor::new(executable, engine);
    Ok(supervisor.run())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.log_level());

    match run(&cli) {
        Ok(verdict) => {
            info!(%verdict, "Exiting");
            ExitCode::from(verdict.exit_code())
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "Authentication could not run");
            // Give the user a moment to read the error before the screen
            // returns to the lock.
            std::thread::sleep(Duration::from_secs(1));
            ExitCode::from(Verdict::Denied.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["lockauth-auth"]);
        assert!(cli.config.is_none());
        assert!(cli.authproto.is_none());
        assert_eq!(cli.log_level(), "warn");
    }

    #[test]
    fn verbosity_flags() {
        assert_eq!(Cli::parse_from(["lockauth-auth", "-v"]).log_level(), "info");
        assert_eq!(Cli::parse_from(["lockauth-auth", "-vv"]).log_level(), "debug");
        assert_eq!(Cli::parse_from(["lockauth-auth", "-vvvv"]).log_level(), "trace");
        assert_eq!(Cli::parse_from(["lockauth-auth", "-q", "-vv"]).log_level(), "error");
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::parse_from([
            "lockauth-auth",
            "--authproto",
            "/opt/lockauth/authproto",
            "-t",
            "30",
        ]);
        assert_eq!(cli.authproto, Some(PathBuf::from("/opt/lockauth/authproto")));
        assert_eq!(cli.timeout, Some(30));
    }

    #[test]
    fn out_of_range_timeout_is_rejected() {
        assert!(Cli::try_parse_from(["lockauth-auth", "-t", "9223372036854775807"]).is_err());
        let longest = MAX_TIMEOUT_SECS.to_string();
        let cli = Cli::try_parse_from(["lockauth-auth", "-t", &longest]).unwrap();
        assert_eq!(cli.timeout, Some(MAX_TIMEOUT_SECS));
    }

    #[test]
    fn explicit_config_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[auth]\npam_service = \"xlock\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from(["lockauth-auth", "-c", &path]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.auth.pam_service, "xlock");
    }

    #[test]
    fn broken_config_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not toml [").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from(["lockauth-auth", "--config", &path]);
        assert!(load_config(&cli).is_err());
    }
}

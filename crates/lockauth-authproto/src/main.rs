//! lockauth-authproto - The checking process.
//!
//! Spawned by `lockauth-auth` with stdin and stdout on pipes. It verifies
//! the invoking user's credential against PAM, relaying every conversation
//! step to the UI process as authproto packets on stdout and reading the
//! answers from stdin. The exit status is the verdict: 0 when the user
//! authenticated, 1 otherwise.
//!
//! Stdout carries the protocol, so logs only ever go to stderr or the
//! journal.

#[cfg(feature = "pam")]
mod pam;

use std::io;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use lockauth_core::{
    AuthStatus, ChannelConversation, Config, Converser, Identity, SharedConverser, Verdict,
};
use nix::unistd::{getuid, gethostname, User};
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

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
        .with(fmt::layer().with_target(true).with_writer(io::stderr))
        .with(filter)
        .init();
}

/// The display the session runs on, passed to PAM as the terminal.
fn display_name(display: Option<String>, wayland_display: Option<String>) -> Option<String> {
    display
        .filter(|d| !d.is_empty())
        .or_else(|| wayland_display.filter(|d| !d.is_empty()))
}

/// Who is authenticating, and from where.
fn current_identity() -> Result<Identity> {
    let uid = getuid();
    let user = User::from_uid(uid)
        .context("Failed to look up the current user")?
        .ok_or_else(|| anyhow!("No passwd entry for uid {}", uid))?;
    let host = gethostname()
        .context("Failed to read the host name")?
        .to_string_lossy()
        .into_owned();

    let identity = Identity::new(user.name, host);
    Ok(
        match display_name(
            std::env::var("DISPLAY").ok(),
            std::env::var("WAYLAND_DISPLAY").ok(),
        ) {
            Some(tty) => identity.with_tty(tty),
            None => identity,
        },
    )
}

#[cfg(feature = "pam")]
fn check(config: &Config, identity: &Identity, converser: SharedConverser) -> AuthStatus {
    use lockauth_core::CredentialChecker;

    let backend = match pam::PamBackend::new(&config.auth.pam_service, converser.clone()) {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "Invalid PAM service name");
            return AuthStatus::ServiceError;
        }
    };
    let mut checker = CredentialChecker::new(backend, converser, config.auth.retry_policy());
    checker.authenticate(identity)
}

#[cfg(not(feature = "pam"))]
fn check(_config: &Config, _identity: &Identity, _converser: SharedConverser) -> AuthStatus {
    error!("Built without PAM support; rebuild with the `pam` feature");
    AuthStatus::ServiceError
}

fn main() -> ExitCode {
    setup_logging();

    let config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load configuration, using defaults");
        Config::default()
    });

    let identity = match current_identity() {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = format!("{e:#}"), "Cannot determine who is authenticating");
            return ExitCode::from(Verdict::Denied.exit_code());
        }
    };

    let channel = match ChannelConversation::stdio() {
        Ok(channel) => channel,
        Err(e) => {
            error!(error = %e, "Cannot open the channel to the UI process");
            return ExitCode::from(Verdict::Denied.exit_code());
        }
    };
    let converser = Converser::shared(channel);
    let status = check(&config, &identity, converser);
    ExitCode::from(Verdict::from_status(status).exit_code())
}

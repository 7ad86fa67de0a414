//! Core types for lockauth.
//!
//! This module contains the data types shared by the UI process and the
//! checking process: backend status codes, the identity being checked, the
//! final verdict, and the prompt display modes.

use serde::Deserialize;

/// Result code of a backend operation.
///
/// The variants mirror the platform authentication module's status codes
/// that the retry policy has to tell apart; anything else is carried in
/// [`AuthStatus::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStatus {
    /// The operation succeeded.
    Success,
    /// The backend asked to abort the whole transaction.
    Abort,
    /// The backend's own attempt limit was hit.
    MaxAttemptsReached,
    /// The credential is valid but must be changed before use.
    CredentialExpired,
    /// The credential was wrong.
    AuthFailed,
    /// The conversation (prompting) failed.
    ConversationFailed,
    /// The identity is not known to the backend.
    UserUnknown,
    /// The account has expired.
    AccountExpired,
    /// Access denied by policy.
    PermissionDenied,
    /// The backend itself failed (module or system error).
    ServiceError,
    /// Any other backend-specific code.
    Other(i32),
}

impl AuthStatus {
    /// Returns whether retrying the operation is pointless.
    ///
    /// Terminal codes stop the retry loop regardless of how many attempts
    /// are left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthStatus::Success
                | AuthStatus::Abort
                | AuthStatus::MaxAttemptsReached
                | AuthStatus::CredentialExpired
        )
    }

    /// Returns whether this is [`AuthStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, AuthStatus::Success)
    }
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStatus::Success => write!(f, "success"),
            AuthStatus::Abort => write!(f, "abort"),
            AuthStatus::MaxAttemptsReached => write!(f, "max_attempts_reached"),
            AuthStatus::CredentialExpired => write!(f, "credential_expired"),
            AuthStatus::AuthFailed => write!(f, "auth_failed"),
            AuthStatus::ConversationFailed => write!(f, "conversation_failed"),
            AuthStatus::UserUnknown => write!(f, "user_unknown"),
            AuthStatus::AccountExpired => write!(f, "account_expired"),
            AuthStatus::PermissionDenied => write!(f, "permission_denied"),
            AuthStatus::ServiceError => write!(f, "service_error"),
            AuthStatus::Other(code) => write!(f, "other({})", code),
        }
    }
}

/// The identity a session authenticates, plus the context the backend is
/// told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Login name of the locked session's owner.
    pub user: String,
    /// Host the session runs on.
    pub host: String,
    /// Terminal or display the session is bound to (e.g. `:0`).
    pub tty: Option<String>,
}

impl Identity {
    /// Create an identity without a terminal context.
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            tty: None,
        }
    }

    /// Attach a terminal or display name.
    pub fn with_tty(mut self, tty: impl Into<String>) -> Self {
        self.tty = Some(tty.into());
        self
    }
}

/// Final pass/fail result of a session.
///
/// Callers only ever see this, never the reason for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The user proved their identity.
    Authenticated,
    /// Anything else: wrong credential, cancellation, timeout, spawn failure.
    Denied,
}

impl Verdict {
    /// Map a checking-process exit code to a verdict.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Verdict::Authenticated
        } else {
            Verdict::Denied
        }
    }

    /// Map a backend status to a verdict.
    pub fn from_status(status: AuthStatus) -> Self {
        if status.is_success() {
            Verdict::Authenticated
        } else {
            Verdict::Denied
        }
    }

    /// The process exit code for this verdict (0 or 1).
    pub fn exit_code(&self) -> u8 {
        match self {
            Verdict::Authenticated => 0,
            Verdict::Denied => 1,
        }
    }

    /// Returns whether the session was authenticated.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Verdict::Authenticated)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Authenticated => write!(f, "authenticated"),
            Verdict::Denied => write!(f, "denied"),
        }
    }
}

/// How hidden (password) input is shown while typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordDisplay {
    /// Fixed-width placeholder with a randomly jumping marker; hides length.
    #[default]
    Cursor,
    /// One asterisk per typed character.
    Asterisks,
    /// Nothing at all.
    Hidden,
}

impl std::fmt::Display for PasswordDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordDisplay::Cursor => write!(f, "cursor"),
            PasswordDisplay::Asterisks => write!(f, "asterisks"),
            PasswordDisplay::Hidden => write!(f, "hidden"),
        }
    }
}

/// Display mode of a single running prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// The literal input is shown (usernames).
    Echo,
    /// One asterisk per decoded character.
    Asterisks,
    /// Nothing is shown.
    Hidden,
    /// Length-hiding placeholder with a movable marker.
    Cursor,
}

impl DisplayMode {
    /// Pick the mode for a prompt given its echo flag and the configured
    /// hidden-input display.
    pub fn for_prompt(echo: bool, password_display: PasswordDisplay) -> Self {
        if echo {
            return DisplayMode::Echo;
        }
        match password_display {
            PasswordDisplay::Cursor => DisplayMode::Cursor,
            PasswordDisplay::Asterisks => DisplayMode::Asterisks,
            PasswordDisplay::Hidden => DisplayMode::Hidden,
        }
    }

    /// Returns whether the typed input is a secret in this mode.
    pub fn is_secret(&self) -> bool {
        !matches!(self, DisplayMode::Echo)
    }
}

//! Credential verification against a pluggable backend.
//!
//! The checking process owns a [`CredentialChecker`], which drives an
//! [`AuthBackend`] (PAM in production) through authentication, the account
//! check and, when required, a credential change. Whenever the backend
//! needs to talk to the user it calls back into a [`Converser`], which maps
//! each conversation step onto a [`Conversation`] (the framed channel to the
//! UI process).
//!
//! # Poisoning
//!
//! The first failed step (the user cancelled, the prompt timed out, the
//! channel broke) poisons the converser. The retry loop sees the flag and
//! stops immediately instead of asking again. A backend that calls the
//! converser again after that is broken; the call fails with
//! [`ConverseError::Reentered`] and the checking process exits.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use secrecy::SecretSlice;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::authproto::ChannelError;
use crate::traits::Conversation;
use crate::types::{AuthStatus, Identity};

/// Default number of attempts per backend operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Errors from answering a single conversation step.
#[derive(Debug, Error)]
pub enum ConversationError {
    /// The user cancelled the prompt, or it timed out.
    #[error("prompt cancelled")]
    Cancelled,

    /// The step kind is not one the checker understands.
    #[error("unsupported conversation step kind {0}")]
    UnsupportedStep(i32),

    /// The channel to the UI process failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Errors from [`Converser::converse`].
#[derive(Debug, Error)]
pub enum ConverseError {
    /// A step failed; the converser is now poisoned.
    #[error("conversation step {index} failed: {source}")]
    StepFailed {
        /// Index of the failing step.
        index: usize,
        /// What went wrong.
        #[source]
        source: ConversationError,
    },

    /// The converser was called again after a failed step.
    #[error("conversation called again after failing")]
    Reentered,
}

/// Kind of a conversation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Prompt whose answer may be shown while typing.
    PromptEcho,
    /// Prompt whose answer must be hidden.
    PromptHidden,
    /// Error message; no answer.
    ErrorAlert,
    /// Informational message; no answer.
    InfoAlert,
    /// A step style the checker does not know, with the backend's raw code.
    Unsupported(i32),
}

/// One step of a backend conversation.
#[derive(Debug, Clone, Copy)]
pub struct Step<'a> {
    /// What the step asks for.
    pub kind: StepKind,
    /// Prompt or message text.
    pub message: &'a [u8],
}

impl<'a> Step<'a> {
    /// Create a step.
    pub fn new(kind: StepKind, message: &'a [u8]) -> Self {
        Self { kind, message }
    }
}

/// Maps backend conversation steps onto a [`Conversation`].
pub struct Converser {
    ui: Box<dyn Conversation>,
    poisoned: bool,
}

/// A converser shared between the checker and its backend.
///
/// The backend calls it from inside its operations while the checker reads
/// and resets the poison flag around them. Both live on the one thread of
/// the checking process.
pub type SharedConverser = Rc<RefCell<Converser>>;

impl Converser {
    /// Create a converser answering through `ui`.
    pub fn new(ui: impl Conversation + 'static) -> Self {
        Self {
            ui: Box::new(ui),
            poisoned: false,
        }
    }

    /// Create a converser wrapped for sharing with a backend.
    pub fn shared(ui: impl Conversation + 'static) -> SharedConverser {
        Rc::new(RefCell::new(Self::new(ui)))
    }

    /// Run a batch of steps, returning one entry per step.
    ///
    /// Prompt steps yield `Some(answer)`, alerts yield `None`. The batch is
    /// all or nothing: on the first failure the answers collected so far are
    /// dropped (and wiped) and the converser is poisoned.
    ///
    /// # Errors
    ///
    /// Returns `Reentered` without touching the UI if the converser is
    /// already poisoned, or `StepFailed` for the first failing step.
    pub fn converse(
        &mut self,
        steps: &[Step<'_>],
    ) -> Result<Vec<Option<SecretSlice<u8>>>, ConverseError> {
        if self.poisoned {
            let first = steps
                .first()
                .map(|s| String::from_utf8_lossy(s.message).into_owned())
                .unwrap_or_else(|| "(none)".to_string());
            error!(
                steps = steps.len(),
                first = %first,
                "Conversation called again after having failed before; the backend module is broken"
            );
            return Err(ConverseError::Reentered);
        }

        let mut answers = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            match self.converse_one(step) {
                Ok(answer) => answers.push(answer),
                Err(source) => {
                    debug!(index, error = %source, "Conversation step failed");
                    self.poisoned = true;
                    return Err(ConverseError::StepFailed { index, source });
                }
            }
        }
        Ok(answers)
    }

    fn converse_one(
        &mut self,
        step: &Step<'_>,
    ) -> Result<Option<SecretSlice<u8>>, ConversationError> {
        match step.kind {
            StepKind::PromptHidden => self.ui.prompt(step.message, false).map(Some),
            StepKind::PromptEcho => self.ui.prompt(step.message, true).map(Some),
            StepKind::ErrorAlert => self.ui.alert(step.message, true).map(|()| None),
            StepKind::InfoAlert => self.ui.alert(step.message, false).map(|()| None),
            StepKind::Unsupported(code) => Err(ConversationError::UnsupportedStep(code)),
        }
    }

    /// Returns whether a step has failed since the last reset.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Clear the poison flag before a new backend operation.
    pub fn reset(&mut self) {
        self.poisoned = false;
    }
}

impl fmt::Debug for Converser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converser")
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

/// Trait for credential backends.
///
/// Every operation returns the backend's status. Conversations happen
/// inside the operations through the [`SharedConverser`] the backend was
/// built with.
pub trait AuthBackend {
    /// Open a backend session for `identity` and tell it the host, remote
    /// user and terminal context.
    fn start(&mut self, identity: &Identity) -> AuthStatus;

    /// Verify the user's credential.
    fn authenticate(&mut self) -> AuthStatus;

    /// Check that the account may be used right now.
    fn account_management(&mut self) -> AuthStatus;

    /// Change an expired credential.
    fn change_expired_credential(&mut self) -> AuthStatus;

    /// Close the session opened by [`AuthBackend::start`].
    ///
    /// `status` is the outcome of the session so far. Called exactly once
    /// per `start`, even when `start` failed.
    fn end(&mut self, status: AuthStatus) -> AuthStatus;

    /// Human-readable description of a status, for logs.
    fn describe(&self, status: AuthStatus) -> String {
        status.to_string()
    }
}

/// Retry policy for backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, at least 1.
    pub max_attempts: u32,
    /// Whether a failed account check fails the session.
    ///
    /// When false, only "credential update required" is acted on and any
    /// other account-check failure is logged and ignored.
    pub strict_account_check: bool,
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, strict_account_check: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strict_account_check,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, true)
    }
}

/// Progress of one retried operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed non-terminal attempts so far.
    pub attempt: u32,
    /// Status of the most recent attempt.
    pub last_status: Option<AuthStatus>,
}

/// Drives a backend through a full authentication.
pub struct CredentialChecker<B> {
    backend: B,
    converser: SharedConverser,
    policy: RetryPolicy,
    last_retry: RetryState,
}

impl<B: AuthBackend> CredentialChecker<B> {
    /// Create a checker. `converser` must be the one `backend` talks to.
    pub fn new(backend: B, converser: SharedConverser, policy: RetryPolicy) -> Self {
        Self {
            backend,
            converser,
            policy,
            last_retry: RetryState::default(),
        }
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The retry policy.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Retry state of the most recent [`CredentialChecker::call_with_retries`].
    pub fn last_retry(&self) -> RetryState {
        self.last_retry
    }

    /// Returns whether the current operation failed in the conversation.
    pub fn conversation_failed(&self) -> bool {
        self.converser.borrow().is_poisoned()
    }

    /// Run `operation` with the retry policy.
    ///
    /// Stops immediately if the conversation failed (the user cancelled or
    /// the prompt timed out) or the status is terminal. Otherwise retries
    /// until `max_attempts` attempts were made and returns the last status.
    pub fn call_with_retries<F>(&mut self, mut operation: F) -> AuthStatus
    where
        F: FnMut(&mut B) -> AuthStatus,
    {
        let mut state = RetryState::default();
        loop {
            self.converser.borrow_mut().reset();
            let status = operation(&mut self.backend);
            state.last_status = Some(status);

            if self.conversation_failed() {
                debug!(%status, "Conversation failed, not retrying");
                break;
            }
            if status.is_terminal() {
                break;
            }

            state.attempt += 1;
            if state.attempt >= self.policy.max_attempts {
                debug!(%status, attempts = state.attempt, "Giving up after max attempts");
                break;
            }
            debug!(%status, attempt = state.attempt, "Retrying backend operation");
        }
        self.last_retry = state;
        state.last_status.unwrap_or(AuthStatus::ServiceError)
    }

    /// Authenticate `identity` from start to finish.
    ///
    /// The backend session is closed exactly once. A failure to close it is
    /// logged and only changes the result when everything else succeeded.
    pub fn authenticate(&mut self, identity: &Identity) -> AuthStatus {
        info!(user = %identity.user, host = %identity.host, "Starting authentication");

        let status = self.backend.start(identity);
        let status = if status.is_success() {
            self.run_session()
        } else {
            error!(%status, "Failed to start backend session");
            status
        };

        let end_status = self.backend.end(status);
        if !end_status.is_success() {
            warn!(
                status = %end_status,
                reason = %self.backend.describe(end_status),
                "Failed to close backend session"
            );
            if status.is_success() {
                return end_status;
            }
        }

        if status.is_success() {
            info!(user = %identity.user, "Authentication succeeded");
        } else {
            info!(user = %identity.user, %status, "Authentication failed");
        }
        status
    }

    fn run_session(&mut self) -> AuthStatus {
        let status = self.call_with_retries(|b| b.authenticate());
        if !status.is_success() {
            self.log_failure("authenticate", status);
            return status;
        }

        let mut account = self.call_with_retries(|b| b.account_management());
        if account == AuthStatus::CredentialExpired {
            info!("Credential expired, requesting a new one");
            account = self.call_with_retries(|b| b.change_expired_credential());
            if !account.is_success() {
                self.log_failure("change_expired_credential", account);
                if self.policy.strict_account_check {
                    return account;
                }
            }
        } else if !account.is_success() {
            self.log_failure("account_management", account);
            if self.policy.strict_account_check {
                return account;
            }
        }

        status
    }

    fn log_failure(&self, operation: &str, status: AuthStatus) {
        if self.conversation_failed() {
            return;
        }
        warn!(
            operation,
            %status,
            reason = %self.backend.describe(status),
            "Backend operation failed"
        );
    }
}

impl<B> fmt::Debug for CredentialChecker<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialChecker")
            .field("policy", &self.policy)
            .field("last_retry", &self.last_retry)
            .finish_non_exhaustive()
    }
}

//! Test doubles for the collaborator traits and the credential backend.
//!
//! Everything here is single-threaded and shares its recorded state through
//! `Rc`, so a test can hand a double to the code under test and keep a
//! clone to inspect afterwards.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use lockauth_core::mock::{KeyEvent, ManualClock, RecordingRenderer, ScriptedKeys};
//! use lockauth_core::{PromptEngine, PromptOutcome, PromptSettings};
//!
//! let clock = ManualClock::new();
//! let keys = ScriptedKeys::new(
//!     vec![KeyEvent::Byte(b'h'), KeyEvent::Byte(b'i'), KeyEvent::Byte(b'\r')],
//!     clock.clone(),
//! );
//! let renderer = RecordingRenderer::new();
//! let mut engine = PromptEngine::new(renderer.clone(), keys, PromptSettings::default())
//!     .with_clock(clock);
//!
//! assert!(matches!(engine.prompt("Login:", true), PromptOutcome::Submitted(_)));
//! assert_eq!(renderer.prompts()[0].0, "Login:");
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use secrecy::{ExposeSecret, SecretSlice};
use tracing::debug;

use crate::checker::{AuthBackend, ConversationError, SharedConverser, Step, StepKind};
use crate::secure_buffer::SecureBuffer;
use crate::traits::{Clock, Conversation, KeySource, MemoryPinner, Renderer};
use crate::types::{AuthStatus, Identity};

/// Something a [`RecordingRenderer`] was asked to draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// A message.
    Message {
        /// Title line.
        title: String,
        /// Body text.
        body: String,
        /// Drawn in the warning style.
        is_warning: bool,
    },
    /// A prompt.
    Prompt {
        /// Prompt label.
        title: String,
        /// Display text of the input field.
        display: String,
        /// Drawn in the warning style.
        is_warning: bool,
    },
    /// The session succeeded.
    Success,
}

/// A renderer that records every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer {
    events: Rc<RefCell<Vec<RenderEvent>>>,
    surfaces_changed: Rc<Cell<bool>>,
}

impl RecordingRenderer {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.borrow().clone()
    }

    /// Recorded messages as `(title, body, is_warning)`.
    pub fn messages(&self) -> Vec<(String, String, bool)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                RenderEvent::Message {
                    title,
                    body,
                    is_warning,
                } => Some((title.clone(), body.clone(), *is_warning)),
                _ => None,
            })
            .collect()
    }

    /// Recorded prompts as `(title, display, is_warning)`.
    pub fn prompts(&self) -> Vec<(String, String, bool)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                RenderEvent::Prompt {
                    title,
                    display,
                    is_warning,
                } => Some((title.clone(), display.clone(), *is_warning)),
                _ => None,
            })
            .collect()
    }

    /// Number of success notifications.
    pub fn success_count(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, RenderEvent::Success))
            .count()
    }

    /// Make the next `surfaces_changed` call report a change.
    pub fn change_surfaces(&self) {
        self.surfaces_changed.set(true);
    }
}

impl Renderer for RecordingRenderer {
    fn render_message(&mut self, title: &str, body: &str, is_warning: bool) {
        self.events.borrow_mut().push(RenderEvent::Message {
            title: title.to_string(),
            body: body.to_string(),
            is_warning,
        });
    }

    fn render_prompt(&mut self, title: &str, display: &str, is_warning: bool) {
        self.events.borrow_mut().push(RenderEvent::Prompt {
            title: title.to_string(),
            display: display.to_string(),
            is_warning,
        });
    }

    fn surfaces_changed(&mut self) -> bool {
        self.surfaces_changed.replace(false)
    }

    fn notify_success(&mut self) {
        self.events.borrow_mut().push(RenderEvent::Success);
    }
}

/// A wall clock that only moves when told to.
///
/// Sleeping advances it instantly.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<SystemTime>>,
}

impl ManualClock {
    /// A clock at an arbitrary fixed time.
    pub fn new() -> Self {
        Self::at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    /// A clock at `now`.
    pub fn at(now: SystemTime) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
        }
    }

    /// Move forward.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Move backward, as a clock adjustment would.
    pub fn rewind(&self, by: Duration) {
        self.now.set(self.now.get() - by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// A pinner that always fails, counting how often it was asked.
#[derive(Debug, Clone, Default)]
pub struct RefusingPinner {
    attempts: Rc<Cell<usize>>,
}

impl RefusingPinner {
    /// Create a pinner with no attempts recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pin requests so far.
    pub fn attempts(&self) -> usize {
        self.attempts.get()
    }
}

impl MemoryPinner for RefusingPinner {
    fn pin(&mut self, _buffer: &mut SecureBuffer) -> bool {
        self.attempts.set(self.attempts.get() + 1);
        false
    }
}

/// One scripted keyboard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// A byte is ready.
    Byte(u8),
    /// No input while this much time passes.
    Idle(Duration),
    /// The clock steps back by this much, with no input.
    Rewind(Duration),
    /// The stream ends.
    Eof,
    /// The stream fails.
    Error,
}

/// A keyboard that plays back a script against a [`ManualClock`].
///
/// An exhausted script reads as end of input.
#[derive(Debug)]
pub struct ScriptedKeys {
    events: VecDeque<KeyEvent>,
    clock: ManualClock,
}

impl ScriptedKeys {
    /// Play back `events`, moving `clock` for idle and rewind events.
    pub fn new(events: impl IntoIterator<Item = KeyEvent>, clock: ManualClock) -> Self {
        Self {
            events: events.into_iter().collect(),
            clock,
        }
    }
}

impl KeySource for ScriptedKeys {
    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        match self.events.front().copied() {
            Some(KeyEvent::Idle(by)) => {
                self.events.pop_front();
                self.clock.advance(by);
                Ok(false)
            }
            Some(KeyEvent::Rewind(by)) => {
                self.events.pop_front();
                self.clock.rewind(by);
                Ok(false)
            }
            Some(KeyEvent::Error) => {
                self.events.pop_front();
                Err(io::Error::other("scripted input failure"))
            }
            Some(KeyEvent::Byte(_)) | Some(KeyEvent::Eof) | None => Ok(true),
        }
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        match self.events.pop_front() {
            Some(KeyEvent::Byte(b)) => Ok(Some(b)),
            Some(KeyEvent::Error) => Err(io::Error::other("scripted input failure")),
            _ => Ok(None),
        }
    }
}

/// A conversation that answers prompts from a script.
///
/// Alerts always succeed and are recorded. A prompt with no scripted
/// answer left is cancelled.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConversation {
    answers: Rc<RefCell<VecDeque<Option<Vec<u8>>>>>,
    prompts: Arc<AtomicUsize>,
    alerts: Rc<RefCell<Vec<(Vec<u8>, bool)>>>,
}

impl ScriptedConversation {
    /// A conversation with no answers scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for the next prompt.
    pub fn answer(self, answer: &[u8]) -> Self {
        self.answers.borrow_mut().push_back(Some(answer.to_vec()));
        self
    }

    /// Queue a cancellation for the next prompt.
    pub fn cancel(self) -> Self {
        self.answers.borrow_mut().push_back(None);
        self
    }

    /// Counter of prompts asked.
    pub fn prompt_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.prompts)
    }

    /// Alerts shown so far, as `(message, is_error)`.
    pub fn alerts(&self) -> Rc<RefCell<Vec<(Vec<u8>, bool)>>> {
        Rc::clone(&self.alerts)
    }
}

impl Conversation for ScriptedConversation {
    fn prompt(
        &mut self,
        _message: &[u8],
        _echo: bool,
    ) -> Result<SecretSlice<u8>, ConversationError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        match self.answers.borrow_mut().pop_front() {
            Some(Some(answer)) => Ok(SecretSlice::from(answer)),
            _ => Err(ConversationError::Cancelled),
        }
    }

    fn alert(&mut self, message: &[u8], is_error: bool) -> Result<(), ConversationError> {
        self.alerts.borrow_mut().push((message.to_vec(), is_error));
        Ok(())
    }
}

/// One scripted backend operation.
///
/// Runs its conversation steps (if any) and returns `on_match` when the
/// first answer equals the expected one (or nothing was expected), and
/// `on_mismatch` otherwise. A failed conversation yields
/// [`AuthStatus::ConversationFailed`].
#[derive(Debug, Clone)]
pub struct BackendCall {
    steps: Vec<(StepKind, Vec<u8>)>,
    expected: Option<Vec<u8>>,
    on_match: AuthStatus,
    on_mismatch: AuthStatus,
}

impl BackendCall {
    /// An operation that returns `status` without talking to the user.
    pub fn status(status: AuthStatus) -> Self {
        Self {
            steps: Vec::new(),
            expected: None,
            on_match: status,
            on_mismatch: AuthStatus::AuthFailed,
        }
    }

    /// An operation that starts with one conversation step.
    pub fn step(kind: StepKind, message: &[u8]) -> Self {
        Self::status(AuthStatus::Success).then(kind, message)
    }

    /// An operation asking a hidden prompt.
    pub fn prompt_hidden(message: &[u8]) -> Self {
        Self::step(StepKind::PromptHidden, message)
    }

    /// An operation asking an echoed prompt.
    pub fn prompt_echo(message: &[u8]) -> Self {
        Self::step(StepKind::PromptEcho, message)
    }

    /// An operation showing an error message.
    pub fn error_alert(message: &[u8]) -> Self {
        Self::step(StepKind::ErrorAlert, message)
    }

    /// An operation showing an informational message.
    pub fn info_alert(message: &[u8]) -> Self {
        Self::step(StepKind::InfoAlert, message)
    }

    /// Add another step to the same conversation call.
    pub fn then(mut self, kind: StepKind, message: &[u8]) -> Self {
        self.steps.push((kind, message.to_vec()));
        self
    }

    /// The answer that counts as a match.
    pub fn expecting(mut self, answer: &[u8]) -> Self {
        self.expected = Some(answer.to_vec());
        self
    }

    /// Status on a match (or when nothing is expected).
    pub fn returns(mut self, status: AuthStatus) -> Self {
        self.on_match = status;
        self
    }

    /// Status on a mismatch.
    pub fn otherwise(mut self, status: AuthStatus) -> Self {
        self.on_mismatch = status;
        self
    }

    fn execute(&self, converser: &SharedConverser) -> AuthStatus {
        if self.steps.is_empty() {
            return self.on_match;
        }
        let steps: Vec<Step<'_>> = self
            .steps
            .iter()
            .map(|(kind, message)| Step::new(*kind, message))
            .collect();
        let result = converser.borrow_mut().converse(&steps);
        match result {
            Ok(answers) => match &self.expected {
                None => self.on_match,
                Some(expected) => {
                    let first = answers.iter().flatten().next();
                    if first.is_some_and(|a| a.expose_secret() == expected.as_slice()) {
                        self.on_match
                    } else {
                        self.on_mismatch
                    }
                }
            },
            Err(e) => {
                debug!(error = %e, "Scripted backend conversation failed");
                AuthStatus::ConversationFailed
            }
        }
    }
}

/// Queue of calls for one operation; the last call repeats.
#[derive(Debug, Clone, Default)]
struct CallScript {
    calls: VecDeque<BackendCall>,
    count: usize,
}

impl CallScript {
    fn next(&mut self) -> BackendCall {
        self.count += 1;
        if self.calls.len() > 1 {
            if let Some(call) = self.calls.pop_front() {
                return call;
            }
        }
        self.calls
            .front()
            .cloned()
            .unwrap_or_else(|| BackendCall::status(AuthStatus::Success))
    }
}

/// A credential backend that plays back scripted operations.
///
/// Every operation succeeds unless scripted otherwise.
#[derive(Debug)]
pub struct ScriptedBackend {
    converser: SharedConverser,
    start_status: AuthStatus,
    end_status: AuthStatus,
    authenticate: CallScript,
    account: CallScript,
    change: CallScript,
    started_as: Option<Identity>,
    end_calls: usize,
    ended_with: Option<AuthStatus>,
}

impl ScriptedBackend {
    /// A backend talking to the user through `converser`.
    pub fn new(converser: SharedConverser) -> Self {
        Self {
            converser,
            start_status: AuthStatus::Success,
            end_status: AuthStatus::Success,
            authenticate: CallScript::default(),
            account: CallScript::default(),
            change: CallScript::default(),
            started_as: None,
            end_calls: 0,
            ended_with: None,
        }
    }

    /// Status returned by `start`.
    pub fn with_start_status(mut self, status: AuthStatus) -> Self {
        self.start_status = status;
        self
    }

    /// Status returned by `end`.
    pub fn with_end_status(mut self, status: AuthStatus) -> Self {
        self.end_status = status;
        self
    }

    /// Queue a call for `authenticate`.
    pub fn on_authenticate(mut self, call: BackendCall) -> Self {
        self.authenticate.calls.push_back(call);
        self
    }

    /// Queue a call for `account_management`.
    pub fn on_account(mut self, call: BackendCall) -> Self {
        self.account.calls.push_back(call);
        self
    }

    /// Queue a call for `change_expired_credential`.
    pub fn on_change(mut self, call: BackendCall) -> Self {
        self.change.calls.push_back(call);
        self
    }

    /// Identity passed to `start`, if it was called.
    pub fn started_as(&self) -> Option<&Identity> {
        self.started_as.as_ref()
    }

    /// Number of `authenticate` calls.
    pub fn authenticate_calls(&self) -> usize {
        self.authenticate.count
    }

    /// Number of `account_management` calls.
    pub fn account_calls(&self) -> usize {
        self.account.count
    }

    /// Number of `change_expired_credential` calls.
    pub fn change_calls(&self) -> usize {
        self.change.count
    }

    /// Number of `end` calls.
    pub fn end_calls(&self) -> usize {
        self.end_calls
    }

    /// Status passed to the last `end` call.
    pub fn ended_with(&self) -> Option<AuthStatus> {
        self.ended_with
    }
}

impl AuthBackend for ScriptedBackend {
    fn start(&mut self, identity: &Identity) -> AuthStatus {
        self.started_as = Some(identity.clone());
        self.start_status
    }

    fn authenticate(&mut self) -> AuthStatus {
        let call = self.authenticate.next();
        call.execute(&self.converser)
    }

    fn account_management(&mut self) -> AuthStatus {
        let call = self.account.next();
        call.execute(&self.converser)
    }

    fn change_expired_credential(&mut self) -> AuthStatus {
        let call = self.change.next();
        call.execute(&self.converser)
    }

    fn end(&mut self, status: AuthStatus) -> AuthStatus {
        self.end_calls += 1;
        self.ended_with = Some(status);
        self.end_status
    }

    fn describe(&self, status: AuthStatus) -> String {
        format!("scripted {}", status)
    }
}

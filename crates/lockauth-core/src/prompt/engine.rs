//! The prompt event loop.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::deadline::Deadline;
use super::display::DisplayBuffer;
use super::state::{Action, PromptState};
use super::{CancelReason, PromptOutcome, PromptSettings, MIN_ALERT_PAUSE};
use crate::secure_buffer::SecureBuffer;
use crate::traits::{
    Clock, KeySource, LayoutSwitcher, MemoryPinner, MlockPinner, NoOpLayoutSwitcher, Renderer,
    SystemClock,
};
use crate::types::DisplayMode;

/// Title of warnings shown by the engine.
pub const ERROR_TITLE: &str = "Error";

/// Shown when the input buffer could not be pinned.
pub const INSECURE_INPUT_WARNING: &str = "Password will not be stored securely.";

/// Shown when the finalized answer could not be pinned.
pub const INSECURE_RESPONSE_WARNING: &str = "Password has not been stored securely.";

/// Runs prompts and alerts against the UI collaborators.
///
/// One engine serves a whole session; each [`PromptEngine::prompt`] call
/// builds fresh [`PromptState`] that is wiped when the call returns.
pub struct PromptEngine {
    renderer: Box<dyn Renderer>,
    input: Box<dyn KeySource>,
    layout: Box<dyn LayoutSwitcher>,
    clock: Box<dyn Clock>,
    pinner: Box<dyn MemoryPinner>,
    settings: PromptSettings,
}

impl PromptEngine {
    /// Create an engine on the system clock with no layout switching.
    pub fn new(
        renderer: impl Renderer + 'static,
        input: impl KeySource + 'static,
        settings: PromptSettings,
    ) -> Self {
        Self {
            renderer: Box::new(renderer),
            input: Box::new(input),
            layout: Box::new(NoOpLayoutSwitcher),
            clock: Box::new(SystemClock),
            pinner: Box::new(MlockPinner),
            settings,
        }
    }

    /// Use a different clock.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Use a layout switcher for Ctrl-S.
    pub fn with_layout_switcher(mut self, layout: impl LayoutSwitcher + 'static) -> Self {
        self.layout = Box::new(layout);
        self
    }

    /// Use a different way of pinning hidden input.
    pub fn with_pinner(mut self, pinner: impl MemoryPinner + 'static) -> Self {
        self.pinner = Box::new(pinner);
        self
    }

    /// The settings.
    pub fn settings(&self) -> &PromptSettings {
        &self.settings
    }

    /// Draw a message and return immediately.
    pub fn show_message(&mut self, title: &str, body: &str, is_warning: bool) {
        self.renderer.render_message(title, body, is_warning);
    }

    /// Draw a message and keep it up for the alert pause (at least one
    /// second).
    pub fn alert(&mut self, title: &str, body: &str, is_warning: bool) {
        self.renderer.render_message(title, body, is_warning);
        self.clock.sleep(self.settings.alert_pause.max(MIN_ALERT_PAUSE));
    }

    /// Returns whether the renderer's surfaces changed since last asked.
    pub fn surfaces_changed(&mut self) -> bool {
        self.renderer.surfaces_changed()
    }

    /// Tell the renderer the session succeeded.
    pub fn notify_success(&mut self) {
        self.renderer.notify_success();
    }

    /// Collect one line of input.
    ///
    /// `echo` selects the echo display; otherwise the configured hidden
    /// display is used and the input buffer is pinned in memory. All typed
    /// bytes are wiped before this returns, whatever the outcome.
    pub fn prompt(&mut self, title: &str, echo: bool) -> PromptOutcome {
        let mode = DisplayMode::for_prompt(echo, self.settings.password_display);
        let mut state = PromptState::new(mode);
        self.run(title, &mut state)
    }

    /// Run the event loop over an existing state.
    pub(crate) fn run(&mut self, title: &str, state: &mut PromptState) -> PromptOutcome {
        let secret = state.mode().is_secret();
        if secret && !self.pinner.pin(state.buffer_mut()) {
            self.alert(ERROR_TITLE, INSECURE_INPUT_WARNING, true);
        }

        debug!(mode = ?state.mode(), "Prompt started");
        let outcome = match self.event_loop(title, state) {
            Ok(()) => self.finalize(state.buffer(), secret),
            Err(reason) => {
                info!(%reason, "Prompt cancelled");
                PromptOutcome::Cancelled(reason)
            }
        };
        state.buffer_mut().clear();
        outcome
    }

    /// Returns `Ok` on submit, or why the prompt was cancelled.
    fn event_loop(&mut self, title: &str, state: &mut PromptState) -> Result<(), CancelReason> {
        let mut deadline = Deadline::new(self.clock.now(), self.settings.timeout);

        loop {
            let display = DisplayBuffer::compose(state);
            self.renderer.render_prompt(title, &display.as_str(), false);
            drop(display);
            state.tick_blink();

            // Block for one blink interval, then drain queued bytes without
            // blocking so the display catches up quickly.
            let mut wait = self.settings.blink_interval;
            loop {
                let now = self.clock.now();
                deadline.clamp(now);
                if deadline.is_expired(now) {
                    return Err(CancelReason::Timeout);
                }

                let readable = self
                    .input
                    .wait_readable(wait.min(deadline.remaining(now)))
                    .map_err(|e| {
                        warn!(error = %e, "Waiting for keyboard input failed");
                        CancelReason::InputError
                    })?;
                if !readable {
                    break;
                }
                wait = Duration::ZERO;

                let byte = match self.input.read_byte() {
                    Ok(Some(byte)) => byte,
                    Ok(None) => {
                        info!("End of keyboard input");
                        return Err(CancelReason::EndOfInput);
                    }
                    Err(e) => {
                        warn!(error = %e, "Reading keyboard input failed");
                        return Err(CancelReason::InputError);
                    }
                };
                deadline.extend(self.clock.now());

                match state.handle_byte(byte) {
                    Action::Continue => {}
                    Action::SwitchLayout => self.layout.switch_layout(),
                    Action::Submit => return Ok(()),
                    Action::Cancel(reason) => return Err(reason),
                }

                if self.renderer.surfaces_changed() {
                    debug!("Display surfaces changed, redrawing");
                    break;
                }
            }
        }
    }

    /// Copy the typed input into an exactly sized buffer for the caller.
    fn finalize(&mut self, typed: &SecureBuffer, secret: bool) -> PromptOutcome {
        let mut response = SecureBuffer::from_slice(typed.as_bytes());
        if secret && !self.pinner.pin(&mut response) {
            self.alert(ERROR_TITLE, INSECURE_RESPONSE_WARNING, true);
        }
        debug!("Prompt submitted");
        PromptOutcome::Submitted(response)
    }
}

impl fmt::Debug for PromptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{
        KeyEvent, ManualClock, RecordingRenderer, RefusingPinner, RenderEvent, ScriptedKeys,
    };
    use crate::types::PasswordDisplay;
    use secrecy::ExposeSecret;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Harness {
        engine: PromptEngine,
        renderer: RecordingRenderer,
    }

    fn harness(events: Vec<KeyEvent>, timeout: Duration, display: PasswordDisplay) -> Harness {
        let clock = ManualClock::new();
        let keys = ScriptedKeys::new(events, clock.clone());
        let renderer = RecordingRenderer::new();
        let settings = PromptSettings {
            timeout,
            password_display: display,
            ..PromptSettings::default()
        };
        let engine = PromptEngine::new(renderer.clone(), keys, settings).with_clock(clock);
        Harness { engine, renderer }
    }

    fn typed(bytes: &[u8]) -> Vec<KeyEvent> {
        bytes.iter().map(|b| KeyEvent::Byte(*b)).collect()
    }

    fn submitted(outcome: PromptOutcome) -> Vec<u8> {
        match outcome {
            PromptOutcome::Submitted(buf) => buf.expose_secret().to_vec(),
            PromptOutcome::Cancelled(reason) => panic!("cancelled: {}", reason),
        }
    }

    #[test]
    fn submit_returns_typed_bytes() {
        let mut h = harness(typed(b"abc\r"), Duration::from_secs(300), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert_eq!(submitted(outcome), b"abc");
    }

    #[test]
    fn submitted_buffer_is_exactly_sized() {
        let mut h = harness(typed(b"abc\n"), Duration::from_secs(300), PasswordDisplay::Cursor);
        match h.engine.prompt("Password:", false) {
            PromptOutcome::Submitted(buf) => assert_eq!(buf.capacity(), 3),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn escape_cancels() {
        let mut h = harness(typed(b"ab\x1b"), Duration::from_secs(300), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert!(matches!(outcome, PromptOutcome::Cancelled(CancelReason::Escape)));
    }

    #[test]
    fn end_of_input_cancels() {
        let mut h = harness(vec![KeyEvent::Eof], Duration::from_secs(300), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert!(matches!(outcome, PromptOutcome::Cancelled(CancelReason::EndOfInput)));
    }

    #[test]
    fn input_error_cancels() {
        let mut h = harness(vec![KeyEvent::Error], Duration::from_secs(300), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert!(matches!(outcome, PromptOutcome::Cancelled(CancelReason::InputError)));
    }

    #[test]
    fn too_long_cancels() {
        let mut events = typed(&[b'a'; 257]);
        events.push(KeyEvent::Byte(b'\r'));
        let mut h = harness(events, Duration::from_secs(300), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert!(matches!(outcome, PromptOutcome::Cancelled(CancelReason::TooLong)));
    }

    #[test]
    fn full_buffer_still_submits() {
        let mut events = typed(&[b'a'; 256]);
        events.push(KeyEvent::Byte(b'\r'));
        let mut h = harness(events, Duration::from_secs(300), PasswordDisplay::Cursor);
        assert_eq!(submitted(h.engine.prompt("Password:", false)).len(), 256);
    }

    #[test]
    fn idle_past_timeout_cancels() {
        let events = vec![KeyEvent::Idle(Duration::from_millis(1001))];
        let mut h = harness(events, Duration::from_secs(1), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert!(matches!(outcome, PromptOutcome::Cancelled(CancelReason::Timeout)));
    }

    #[test]
    fn idle_exactly_timeout_does_not_cancel() {
        let mut events = vec![KeyEvent::Idle(Duration::from_secs(1))];
        events.extend(typed(b"x\r"));
        let mut h = harness(events, Duration::from_secs(1), PasswordDisplay::Cursor);
        assert_eq!(submitted(h.engine.prompt("Password:", false)), b"x");
    }

    #[test]
    fn keystroke_just_before_deadline_extends_it() {
        let mut events = vec![
            KeyEvent::Idle(Duration::from_millis(999)),
            KeyEvent::Byte(b'a'),
            // Past the original deadline, inside the new one.
            KeyEvent::Idle(Duration::from_millis(900)),
        ];
        events.extend(typed(b"b\r"));
        let mut h = harness(events, Duration::from_secs(1), PasswordDisplay::Cursor);
        assert_eq!(submitted(h.engine.prompt("Password:", false)), b"ab");
    }

    #[test]
    fn keystroke_then_idle_past_new_deadline_cancels() {
        let events = vec![
            KeyEvent::Idle(Duration::from_millis(999)),
            KeyEvent::Byte(b'a'),
            KeyEvent::Idle(Duration::from_millis(1001)),
        ];
        let mut h = harness(events, Duration::from_secs(1), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert!(matches!(outcome, PromptOutcome::Cancelled(CancelReason::Timeout)));
    }

    #[test]
    fn huge_timeout_still_prompts() {
        let mut h = harness(
            typed(b"ok\r"),
            Duration::from_secs(u64::MAX),
            PasswordDisplay::Cursor,
        );
        assert_eq!(submitted(h.engine.prompt("Password:", false)), b"ok");
    }

    #[test]
    fn clock_stepping_back_does_not_extend_timeout() {
        let events = vec![
            KeyEvent::Rewind(Duration::from_secs(3600)),
            KeyEvent::Idle(Duration::from_millis(10_001)),
        ];
        let mut h = harness(events, Duration::from_secs(10), PasswordDisplay::Cursor);
        let outcome = h.engine.prompt("Password:", false);
        assert!(matches!(outcome, PromptOutcome::Cancelled(CancelReason::Timeout)));
    }

    #[test]
    fn echo_prompt_renders_typed_text() {
        let mut events = typed(b"bob");
        events.push(KeyEvent::Idle(Duration::from_millis(250)));
        events.push(KeyEvent::Byte(b'\r'));
        let mut h = harness(events, Duration::from_secs(300), PasswordDisplay::Cursor);
        assert_eq!(submitted(h.engine.prompt("Login:", true)), b"bob");
        let prompts = h.renderer.prompts();
        assert_eq!(prompts.first().map(|p| p.1.as_str()), Some("_"));
        assert!(prompts.iter().any(|p| p.0 == "Login:" && p.1 == "bob_"));
    }

    #[test]
    fn asterisks_prompt_renders_stars() {
        let mut events = typed(b"ab");
        events.push(KeyEvent::Idle(Duration::from_millis(250)));
        events.extend(typed(b"\r"));
        let mut h = harness(events, Duration::from_secs(300), PasswordDisplay::Asterisks);
        submitted(h.engine.prompt("Password:", false));
        assert!(h.renderer.prompts().iter().any(|p| p.1 == "**_"));
        assert!(!h.renderer.prompts().iter().any(|p| p.1.contains('a')));
    }

    #[test]
    fn cursor_prompt_never_reveals_length() {
        let mut events = Vec::new();
        for b in b"password" {
            events.push(KeyEvent::Byte(*b));
            events.push(KeyEvent::Idle(Duration::from_millis(250)));
        }
        events.push(KeyEvent::Byte(b'\r'));
        let mut h = harness(events, Duration::from_secs(300), PasswordDisplay::Cursor);
        submitted(h.engine.prompt("Password:", false));
        for (_, display, _) in h.renderer.prompts() {
            assert_eq!(display.len(), 16);
        }
    }

    #[test]
    fn layout_switch_is_delegated() {
        struct Counting(Rc<Cell<usize>>);
        impl LayoutSwitcher for Counting {
            fn switch_layout(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let switches = Rc::new(Cell::new(0));
        let clock = ManualClock::new();
        let keys = ScriptedKeys::new(typed(b"a\x13b\r"), clock.clone());
        let mut engine = PromptEngine::new(RecordingRenderer::new(), keys, PromptSettings::default())
            .with_clock(clock)
            .with_layout_switcher(Counting(switches.clone()));

        assert_eq!(submitted(engine.prompt("Password:", false)), b"ab");
        assert_eq!(switches.get(), 1);
    }

    #[test]
    fn alert_pauses_for_configured_time() {
        let clock = ManualClock::new();
        let start = clock.now();
        let keys = ScriptedKeys::new(Vec::new(), clock.clone());
        let renderer = RecordingRenderer::new();
        let settings = PromptSettings {
            alert_pause: Duration::from_secs(2),
            ..PromptSettings::default()
        };
        let mut engine = PromptEngine::new(renderer.clone(), keys, settings).with_clock(clock.clone());

        engine.alert("Error", "Account locked", true);
        assert_eq!(
            clock.now().duration_since(start).unwrap(),
            Duration::from_secs(2)
        );

        let short = PromptSettings {
            alert_pause: Duration::from_millis(10),
            ..PromptSettings::default()
        };
        let keys = ScriptedKeys::new(Vec::new(), clock.clone());
        let mut engine = PromptEngine::new(RecordingRenderer::new(), keys, short).with_clock(clock.clone());
        let before = clock.now();
        engine.alert("PAM says", "hi", false);
        assert_eq!(
            clock.now().duration_since(before).unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            renderer.events(),
            vec![RenderEvent::Message {
                title: "Error".to_string(),
                body: "Account locked".to_string(),
                is_warning: true,
            }]
        );
    }

    #[test]
    fn unpinned_hidden_input_warns_twice() {
        let clock = ManualClock::new();
        let start = clock.now();
        let keys = ScriptedKeys::new(typed(b"abc\r"), clock.clone());
        let renderer = RecordingRenderer::new();
        let pinner = RefusingPinner::new();
        let mut engine = PromptEngine::new(renderer.clone(), keys, PromptSettings::default())
            .with_clock(clock.clone())
            .with_pinner(pinner.clone());

        assert_eq!(submitted(engine.prompt("Password:", false)), b"abc");
        assert_eq!(pinner.attempts(), 2);
        assert_eq!(
            renderer.messages(),
            vec![
                (ERROR_TITLE.to_string(), INSECURE_INPUT_WARNING.to_string(), true),
                (ERROR_TITLE.to_string(), INSECURE_RESPONSE_WARNING.to_string(), true),
            ]
        );
        // The input warning comes before the first prompt is drawn.
        assert!(matches!(renderer.events()[0], RenderEvent::Message { .. }));
        assert_eq!(
            clock.now().duration_since(start).unwrap(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn echo_input_is_never_pinned() {
        let clock = ManualClock::new();
        let keys = ScriptedKeys::new(typed(b"bob\r"), clock.clone());
        let renderer = RecordingRenderer::new();
        let pinner = RefusingPinner::new();
        let mut engine = PromptEngine::new(renderer.clone(), keys, PromptSettings::default())
            .with_clock(clock)
            .with_pinner(pinner.clone());

        assert_eq!(submitted(engine.prompt("Login:", true)), b"bob");
        assert_eq!(pinner.attempts(), 0);
        assert!(renderer.messages().is_empty());
    }

    #[test]
    fn surface_change_redraws_before_next_key() {
        let clock = ManualClock::new();
        let keys = ScriptedKeys::new(typed(b"abc\r"), clock.clone());
        let renderer = RecordingRenderer::new();
        let mut engine = PromptEngine::new(renderer.clone(), keys, PromptSettings::default())
            .with_clock(clock);

        renderer.change_surfaces();
        assert_eq!(submitted(engine.prompt("Password:", false)), b"abc");
        assert_eq!(renderer.prompts().len(), 2);
    }

    #[test]
    fn queued_keys_drain_after_one_draw() {
        let clock = ManualClock::new();
        let keys = ScriptedKeys::new(typed(b"abc\r"), clock.clone());
        let renderer = RecordingRenderer::new();
        let mut engine = PromptEngine::new(renderer.clone(), keys, PromptSettings::default())
            .with_clock(clock);

        assert_eq!(submitted(engine.prompt("Password:", false)), b"abc");
        assert_eq!(renderer.prompts().len(), 1);
    }

    #[test]
    fn state_is_wiped_after_prompt() {
        let clock = ManualClock::new();
        let keys = ScriptedKeys::new(typed(b"secret\x1b"), clock.clone());
        let mut engine = PromptEngine::new(RecordingRenderer::new(), keys, PromptSettings::default())
            .with_clock(clock);
        let mut state = PromptState::new(DisplayMode::Hidden);
        let outcome = engine.run("Password:", &mut state);
        assert!(outcome.is_cancelled());
        assert!(state.buffer().is_empty());
    }
}

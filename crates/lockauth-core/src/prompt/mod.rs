//! Keystroke-driven password entry.
//!
//! A [`PromptEngine`] collects one line of input from a byte-at-a-time
//! [`KeySource`](crate::traits::KeySource), redrawing the prompt through a
//! [`Renderer`](crate::traits::Renderer) every blink interval, and resolves
//! to either a finalized secret or a cancellation.
//!
//! The pieces:
//! - [`state`]: the pure per-byte state machine and the typed buffer
//! - [`display`]: composing the display text for each mode
//! - [`deadline`]: inactivity deadline on the wall clock
//! - [`input`]: the real keyboard ([`KeyboardInput`])
//! - [`engine`]: the event loop tying them together

use std::fmt;
use std::time::Duration;

use crate::secure_buffer::SecureBuffer;
use crate::types::PasswordDisplay;

pub mod deadline;
pub mod display;
pub mod engine;
pub mod input;
pub mod state;

pub use deadline::Deadline;
pub use display::DisplayBuffer;
pub use engine::PromptEngine;
pub use input::KeyboardInput;
pub use state::{Action, PromptState};

/// Capacity of the typed-input buffer in bytes.
pub const PASSWORD_CAPACITY: usize = 256;

/// Interval between redraws while waiting for input.
pub const BLINK_INTERVAL: Duration = Duration::from_millis(250);

/// Default inactivity timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest accepted inactivity timeout, in seconds (one year).
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Longest accepted inactivity timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(MAX_TIMEOUT_SECS);

/// Shortest time a backend message stays on screen.
pub const MIN_ALERT_PAUSE: Duration = Duration::from_secs(1);

/// Settings for running prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptSettings {
    /// Inactivity timeout; every keystroke restarts it.
    pub timeout: Duration,
    /// How hidden input is displayed.
    pub password_display: PasswordDisplay,
    /// Redraw interval while idle.
    pub blink_interval: Duration,
    /// How long alerts stay on screen.
    pub alert_pause: Duration,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            password_display: PasswordDisplay::default(),
            blink_interval: BLINK_INTERVAL,
            alert_pause: MIN_ALERT_PAUSE,
        }
    }
}

/// Why a prompt ended without a submitted answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Escape or NUL was pressed.
    Escape,
    /// No keystroke within the timeout.
    Timeout,
    /// The input stream ended.
    EndOfInput,
    /// More input than the buffer holds.
    TooLong,
    /// Reading the input stream failed.
    InputError,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Escape => write!(f, "escape"),
            CancelReason::Timeout => write!(f, "timeout"),
            CancelReason::EndOfInput => write!(f, "end_of_input"),
            CancelReason::TooLong => write!(f, "too_long"),
            CancelReason::InputError => write!(f, "input_error"),
        }
    }
}

/// Result of one prompt.
#[derive(Debug)]
pub enum PromptOutcome {
    /// The user pressed Return. The buffer is sized exactly to the answer.
    Submitted(SecureBuffer),
    /// The prompt ended without an answer.
    Cancelled(CancelReason),
}

impl PromptOutcome {
    /// Returns whether the prompt was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PromptOutcome::Cancelled(_))
    }
}

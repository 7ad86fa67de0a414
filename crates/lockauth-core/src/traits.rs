//! Trait definitions for pluggable components.
//!
//! These traits define the interfaces for:
//! - Rendering messages and prompts on every display surface
//! - Reading keystrokes one byte at a time
//! - Switching the keyboard layout from inside a prompt
//! - Reading the wall clock (so deadlines can be tested)
//! - Pinning credential buffers in memory
//! - Answering conversation steps on behalf of the credential backend
//!
//! By using traits, the prompt engine and the supervisor can be tested with
//! the recording doubles in [`crate::mock`], and different front ends
//! (terminal, X11, Wayland) can be plugged in.

use std::io;
use std::time::{Duration, SystemTime};

use secrecy::SecretSlice;

use crate::checker::ConversationError;
use crate::secure_buffer::SecureBuffer;

/// Trait for the display side of a session.
///
/// Implementations (re)draw on every currently active surface and return
/// once drawing has been flushed.
pub trait Renderer {
    /// Show a titled message. Warnings are drawn in the warning style.
    fn render_message(&mut self, title: &str, body: &str, is_warning: bool);

    /// Show a prompt with the current display text of the input field.
    fn render_prompt(&mut self, title: &str, display: &str, is_warning: bool);

    /// Returns whether the set of surfaces changed since the last call.
    ///
    /// When this returns `true`, the caller re-renders before waiting for
    /// input again.
    fn surfaces_changed(&mut self) -> bool {
        false
    }

    /// Called once when a session ends with a successful verdict.
    fn notify_success(&mut self) {}
}

/// Trait for the raw keyboard input stream.
pub trait KeySource {
    /// Wait up to `timeout` for input. Returns whether a byte (or the end
    /// of the stream) can be read without blocking.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Read one byte. Returns `None` at the end of the stream.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
}

/// Trait for keyboard layout switching (Ctrl-S inside a prompt).
pub trait LayoutSwitcher {
    /// Switch to the next keyboard layout.
    fn switch_layout(&mut self);
}

/// A layout switcher that does nothing.
///
/// Used on front ends without keyboard layout support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLayoutSwitcher;

impl LayoutSwitcher for NoOpLayoutSwitcher {
    fn switch_layout(&mut self) {
        tracing::debug!("Keyboard layout switching not supported, ignoring");
    }
}

/// Source of wall-clock time.
///
/// Deadlines are computed on the wall clock because the clock stepping
/// backwards is one of the cases the prompt engine has to handle.
pub trait Clock {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Block for `duration`.
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Trait for keeping credential buffers out of swap.
pub trait MemoryPinner {
    /// Pin `buffer`'s pages. Returns `false` if they could not be pinned.
    fn pin(&mut self, buffer: &mut SecureBuffer) -> bool;
}

/// Pins with `mlock`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MlockPinner;

impl MemoryPinner for MlockPinner {
    fn pin(&mut self, buffer: &mut SecureBuffer) -> bool {
        buffer.try_lock()
    }
}

/// Trait for whoever answers the credential backend's conversation steps.
///
/// In the checking process this is [`crate::authproto::ChannelConversation`],
/// which forwards every step to the UI process over the framed channel.
pub trait Conversation {
    /// Ask the user for one line of input.
    ///
    /// # Errors
    ///
    /// Returns `ConversationError::Cancelled` if the user cancelled or the
    /// prompt timed out. Any other error means the channel broke.
    fn prompt(&mut self, message: &[u8], echo: bool)
        -> Result<SecretSlice<u8>, ConversationError>;

    /// Show an informational or error message. No answer is expected.
    fn alert(&mut self, message: &[u8], is_error: bool) -> Result<(), ConversationError>;
}

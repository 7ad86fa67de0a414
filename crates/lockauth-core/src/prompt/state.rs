//! Per-byte state machine of a running prompt.
//!
//! [`PromptState::handle_byte`] is pure apart from the display marker's
//! random number generator, so every key rule can be tested without a
//! terminal or a clock.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;
use zeroize::Zeroize;

use super::{CancelReason, PASSWORD_CAPACITY};
use crate::secure_buffer::SecureBuffer;
use crate::types::DisplayMode;

/// Width of the length-hiding display in cells.
pub const CURSOR_DISPLAY_WIDTH: usize = 16;

/// Smallest distance the length-hiding marker moves per keystroke.
pub const CURSOR_MIN_CHANGE: usize = 4;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;
const CTRL_A: u8 = 0x01;
const CTRL_U: u8 = 0x15;
const CTRL_S: u8 = 0x13;
const ESCAPE: u8 = 0x1B;

/// What the event loop does after a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep reading.
    Continue,
    /// Ask the layout switcher for the next layout, then keep reading.
    SwitchLayout,
    /// The user pressed Return.
    Submit,
    /// The prompt ends without an answer.
    Cancel(CancelReason),
}

/// State of one running prompt.
///
/// Dropping the state wipes the typed input and the marker.
pub struct PromptState {
    mode: DisplayMode,
    buffer: SecureBuffer,
    marker: usize,
    blinks: u32,
    rng: StdRng,
}

impl PromptState {
    /// A fresh, empty prompt state.
    pub fn new(mode: DisplayMode) -> Self {
        Self::with_rng(mode, StdRng::from_rng(&mut rand::rng()))
    }

    /// A fresh state with a given generator, for reproducible markers.
    pub fn with_rng(mode: DisplayMode, rng: StdRng) -> Self {
        Self {
            mode,
            buffer: SecureBuffer::with_capacity(PASSWORD_CAPACITY),
            marker: 0,
            blinks: 0,
            rng,
        }
    }

    /// Display mode of this prompt.
    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    /// The typed input.
    pub fn buffer(&self) -> &SecureBuffer {
        &self.buffer
    }

    /// Mutable access to the typed input (for pinning it).
    pub fn buffer_mut(&mut self) -> &mut SecureBuffer {
        &mut self.buffer
    }

    /// Cell of the length-hiding marker, in `0..CURSOR_DISPLAY_WIDTH`.
    pub fn marker(&self) -> usize {
        self.marker
    }

    /// Whether the blinking cursor is in its visible phase.
    pub fn cursor_visible(&self) -> bool {
        self.blinks % 2 == 0
    }

    /// Advance the blink phase after a redraw.
    pub fn tick_blink(&mut self) {
        self.blinks = self.blinks.wrapping_add(1);
    }

    /// Apply one input byte.
    pub fn handle_byte(&mut self, byte: u8) -> Action {
        // Keep the cursor visible while typing.
        self.blinks = 0;

        match byte {
            BACKSPACE | DELETE => {
                if self.buffer.pop_char() {
                    self.move_marker();
                }
                Action::Continue
            }
            CTRL_A | CTRL_U => {
                if !self.buffer.is_empty() {
                    self.buffer.clear();
                    self.move_marker();
                }
                Action::Continue
            }
            CTRL_S => Action::SwitchLayout,
            0 | ESCAPE => Action::Cancel(CancelReason::Escape),
            b'\r' | b'\n' => Action::Submit,
            0x01..=0x1F => Action::Continue,
            _ => match self.buffer.push(byte) {
                Ok(()) => {
                    self.move_marker();
                    Action::Continue
                }
                Err(_) => {
                    warn!("Password entered is too long, bailing out");
                    Action::Cancel(CancelReason::TooLong)
                }
            },
        }
    }

    /// Move the length-hiding marker after the buffer changed.
    ///
    /// An empty buffer puts it at cell 0. Otherwise it jumps to a cell in
    /// `1..CURSOR_DISPLAY_WIDTH` at least [`CURSOR_MIN_CHANGE`] cells away
    /// from where it was, chosen uniformly among those.
    fn move_marker(&mut self) {
        if self.buffer.is_empty() {
            self.marker = 0;
            return;
        }
        let prev = self.marker;
        let eligible = |cell: &usize| cell.abs_diff(prev) >= CURSOR_MIN_CHANGE;
        let choices = (1..CURSOR_DISPLAY_WIDTH).filter(eligible).count();
        let mut pick = self.rng.random_range(0..choices);
        self.marker = (1..CURSOR_DISPLAY_WIDTH)
            .filter(eligible)
            .nth(pick)
            .unwrap_or(1);
        pick.zeroize();
    }
}

impl Drop for PromptState {
    fn drop(&mut self) {
        self.marker.zeroize();
        self.blinks.zeroize();
    }
}

impl fmt::Debug for PromptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptState")
            .field("mode", &self.mode)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

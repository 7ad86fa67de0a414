//! Display text of a running prompt.

use std::borrow::Cow;
use std::fmt;

use zeroize::Zeroize;

use super::state::{PromptState, CURSOR_DISPLAY_WIDTH};
use super::PASSWORD_CAPACITY;
use crate::types::DisplayMode;

/// Room for the input, the blinking cursor and the terminating NUL.
pub const DISPLAY_CAPACITY: usize = PASSWORD_CAPACITY + 2;

/// Glyph of the blinking cursor in its visible phase.
pub const CURSOR_GLYPH: u8 = b'_';

/// Fixed-size, NUL-terminated display text.
///
/// In echo mode this holds the typed input, so it is wiped on drop.
pub struct DisplayBuffer {
    bytes: [u8; DISPLAY_CAPACITY],
    len: usize,
}

impl DisplayBuffer {
    /// Compose the display text for `state`.
    ///
    /// - `Echo`: the typed bytes, then the blinking cursor
    /// - `Asterisks`: one `*` per decoded character, then the blinking cursor
    /// - `Hidden`: nothing
    /// - `Cursor`: [`CURSOR_DISPLAY_WIDTH`] dashes with a `|` at the marker
    pub fn compose(state: &PromptState) -> Self {
        let mut display = Self {
            bytes: [0; DISPLAY_CAPACITY],
            len: 0,
        };
        let blink = state.mode() == DisplayMode::Echo || state.mode() == DisplayMode::Asterisks;

        match state.mode() {
            DisplayMode::Echo => {
                let typed = state.buffer().as_bytes();
                display.bytes[..typed.len()].copy_from_slice(typed);
                display.len = typed.len();
            }
            DisplayMode::Asterisks => {
                let count = state.buffer().char_count();
                display.bytes[..count].fill(b'*');
                display.len = count;
            }
            DisplayMode::Hidden => {}
            DisplayMode::Cursor => {
                display.bytes[..CURSOR_DISPLAY_WIDTH].fill(b'-');
                display.bytes[state.marker()] = b'|';
                display.len = CURSOR_DISPLAY_WIDTH;
            }
        }

        if blink {
            display.bytes[display.len] = if state.cursor_visible() {
                CURSOR_GLYPH
            } else {
                b' '
            };
            display.len += 1;
        }
        display.bytes[display.len] = 0;
        display
    }

    /// The display text without the terminating NUL.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The display text including the terminating NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.bytes[..=self.len]
    }

    /// The display text for rendering, replacing invalid UTF-8.
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    /// Length without the terminating NUL.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether nothing is displayed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DisplayBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
        self.len = 0;
    }
}

impl fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("bytes", &"[REDACTED]")
            .field("len", &self.len)
            .finish()
    }
}

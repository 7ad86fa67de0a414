//! A one-line terminal front end.
//!
//! The whole UI is a single status line on stderr that every render
//! rewrites in place. Keystrokes come from stdin, which [`RawMode`] switches
//! to byte-at-a-time input without echo for the lifetime of the session.

use std::io::{self, IsTerminal, Write};
use std::os::fd::{AsFd, OwnedFd};

use lockauth_core::Renderer;
use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use tracing::{debug, warn};

const CLEAR_LINE: &str = "\r\x1b[2K";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Renders prompts and messages as a single rewritten line.
pub struct TerminalRenderer<W> {
    out: W,
    color: bool,
}

impl TerminalRenderer<io::Stderr> {
    /// Render to stderr, in color when it is a terminal.
    pub fn stderr() -> Self {
        let out = io::stderr();
        let color = out.is_terminal();
        Self::new(out, color)
    }
}

impl<W: Write> TerminalRenderer<W> {
    /// Render to `out`; `color` marks warnings in red.
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    /// The output stream.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self, title: &str, text: &str, is_warning: bool) {
        let result = if is_warning && self.color {
            write!(self.out, "{CLEAR_LINE}{RED}{title}{text}{RESET}")
        } else {
            write!(self.out, "{CLEAR_LINE}{title}{text}")
        };
        if let Err(e) = result.and_then(|()| self.out.flush()) {
            debug!(error = %e, "Failed to draw to terminal");
        }
    }
}

impl<W: Write> Renderer for TerminalRenderer<W> {
    fn render_message(&mut self, title: &str, body: &str, is_warning: bool) {
        if body.is_empty() {
            self.draw(title, "", is_warning);
        } else {
            self.draw(title, &format!(": {body}"), is_warning);
        }
    }

    fn render_prompt(&mut self, title: &str, display: &str, is_warning: bool) {
        self.draw(title, display, is_warning);
    }

    fn notify_success(&mut self) {
        self.draw("Unlocked", "\n", false);
    }
}

/// Puts a terminal into raw input mode until dropped.
///
/// Canonical mode, echo, signal keys and flow control are all off, so every
/// key (including Ctrl-C and Ctrl-S) arrives as a byte.
pub struct RawMode {
    fd: OwnedFd,
    saved: Termios,
}

impl RawMode {
    /// Switch `fd` to raw mode, or return `None` if it is not a terminal.
    pub fn enable(fd: impl AsFd) -> io::Result<Option<Self>> {
        let fd = fd.as_fd();
        if !fd.is_terminal() {
            debug!("Input is not a terminal, leaving its mode alone");
            return Ok(None);
        }
        let fd = fd.try_clone_to_owned()?;

        let saved = termios::tcgetattr(&fd)?;
        let mut raw = saved.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG | LocalFlags::IEXTEN);
        raw.input_flags.remove(InputFlags::ICRNL | InputFlags::IXON);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(&fd, SetArg::TCSANOW, &raw)?;

        debug!("Terminal switched to raw mode");
        Ok(Some(Self { fd, saved }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&self.fd, SetArg::TCSANOW, &self.saved) {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(f: impl FnOnce(&mut TerminalRenderer<Vec<u8>>), color: bool) -> String {
        let mut renderer = TerminalRenderer::new(Vec::new(), color);
        f(&mut renderer);
        String::from_utf8(renderer.into_inner()).unwrap()
    }

    #[test]
    fn prompt_rewrites_the_line() {
        let out = rendered(|r| r.render_prompt("Password: ", "|---------------", false), true);
        assert_eq!(out, "\r\x1b[2KPassword: |---------------");
    }

    #[test]
    fn message_joins_title_and_body() {
        let out = rendered(|r| r.render_message("PAM says", "Last login today", false), true);
        assert_eq!(out, "\r\x1b[2KPAM says: Last login today");
    }

    #[test]
    fn message_without_body_shows_title_only() {
        let out = rendered(|r| r.render_message("Processing...", "", false), false);
        assert_eq!(out, "\r\x1b[2KProcessing...");
    }

    #[test]
    fn warnings_are_red_only_with_color() {
        let colored = rendered(|r| r.render_message("Error", "Account locked", true), true);
        assert!(colored.contains("\x1b[31mError: Account locked\x1b[0m"));

        let plain = rendered(|r| r.render_message("Error", "Account locked", true), false);
        assert!(!plain.contains("\x1b[31m"));
    }

    #[test]
    fn success_ends_the_line() {
        let out = rendered(|r| r.notify_success(), false);
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn raw_mode_skips_non_terminals() {
        let file = tempfile::tempfile().unwrap();
        assert!(RawMode::enable(&file).unwrap().is_none());
    }
}

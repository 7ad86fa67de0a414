//! Inactivity deadline on the wall clock.

use std::time::{Duration, SystemTime};

use super::MAX_TIMEOUT;

/// Absolute point in time after which a prompt gives up.
///
/// The deadline lives on the wall clock, which can step in either
/// direction. A forward step simply expires it early. A backward step would
/// leave it further away than the timeout window, so [`Deadline::clamp`]
/// pulls it back to at most one window from now.
///
/// Windows longer than [`MAX_TIMEOUT`] are cut down to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: SystemTime,
    window: Duration,
}

impl Deadline {
    /// A deadline one `window` after `now`.
    pub fn new(now: SystemTime, window: Duration) -> Self {
        let window = window.min(MAX_TIMEOUT);
        Self {
            at: after(now, window),
            window,
        }
    }

    /// The absolute deadline.
    pub fn at(&self) -> SystemTime {
        self.at
    }

    /// The timeout window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns whether `now` is strictly past the deadline.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.at
    }

    /// Pull the deadline back to `now + window` if the clock stepped back.
    pub fn clamp(&mut self, now: SystemTime) {
        let latest = after(now, self.window);
        if self.at > latest {
            self.at = latest;
        }
    }

    /// Restart the window at `now` (a key was pressed).
    pub fn extend(&mut self, now: SystemTime) {
        self.at = after(now, self.window);
    }

    /// Time left until the deadline, zero if it has passed.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.at.duration_since(now).unwrap_or(Duration::ZERO)
    }
}

/// `now + window`, or `now` if that is past the end of representable time.
fn after(now: SystemTime, window: Duration) -> SystemTime {
    now.checked_add(window).unwrap_or(now)
}

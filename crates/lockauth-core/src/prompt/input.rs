//! The real keyboard: a raw, unbuffered file descriptor.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use zeroize::Zeroizing;

use crate::traits::KeySource;

/// Keystrokes read one byte at a time from a file descriptor.
///
/// Reads bypass any userspace buffering so no keystroke lingers in a buffer
/// we do not wipe. Putting a terminal into raw mode is the caller's job.
#[derive(Debug)]
pub struct KeyboardInput {
    file: File,
}

impl KeyboardInput {
    /// Read from a duplicate of standard input.
    pub fn stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::from_fd(fd))
    }

    /// Read from the given descriptor.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }
}

impl KeySource for KeyboardInput {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(n) => Ok(n > 0),
            // A signal woke us; treat it like an idle tick.
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = Zeroizing::new([0u8; 1]);
        loop {
            match self.file.read(&mut byte[..]) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

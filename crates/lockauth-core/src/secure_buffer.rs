//! Fixed-capacity byte buffer for credential material.
//!
//! A [`SecureBuffer`] owns one heap allocation of a fixed capacity that is
//! never reallocated, so the secret is never copied behind our back by a
//! growing `Vec`. The allocation can be pinned with `mlock` to keep it out of
//! swap, and it is zeroed before it is released on every exit path, panics
//! included, because the wipe lives in `Drop`.
//!
//! # Security
//!
//! - The whole allocation (not just the used prefix) is zeroed on drop
//! - Memory locking is best effort: failure is reported, never fatal
//! - Debug output shows `[REDACTED]` instead of the contents

use std::fmt;

use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Returned when a write would exceed the buffer's fixed capacity.
///
/// The buffer is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("secure buffer full ({capacity} bytes)")]
pub struct CapacityExceeded {
    /// Capacity of the buffer that rejected the write.
    pub capacity: usize,
}

/// A fixed-capacity, zero-on-drop byte buffer.
pub struct SecureBuffer {
    /// Backing storage; its length is the capacity.
    data: Box<[u8]>,
    /// Number of bytes in use.
    len: usize,
    /// Whether `data` is currently locked with `mlock`.
    locked: bool,
}

impl SecureBuffer {
    /// Create an empty buffer with the given capacity.
    ///
    /// The memory is not locked; call [`SecureBuffer::try_lock`] for that.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            locked: false,
        }
    }

    /// Create a buffer holding exactly `bytes`, with no spare capacity.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buffer = Self::with_capacity(bytes.len());
        buffer.data.copy_from_slice(bytes);
        buffer.len = bytes.len();
        buffer
    }

    /// Try to lock the backing memory against swapping.
    ///
    /// Returns whether the memory is locked afterwards. Locking requires
    /// `CAP_IPC_LOCK` or enough `RLIMIT_MEMLOCK`, so failure is common for
    /// unprivileged processes.
    pub fn try_lock(&mut self) -> bool {
        if self.locked {
            return true;
        }
        if self.data.is_empty() {
            // Nothing to pin.
            self.locked = true;
            return true;
        }

        // Safety: we lock exactly our own allocation, which outlives the lock
        // because Drop unlocks before the box is freed.
        let ok = unsafe { memsec::mlock(self.data.as_mut_ptr(), self.data.len()) };
        if ok {
            debug!(capacity = self.data.len(), "Secure buffer memory locked");
            self.locked = true;
        } else {
            warn!(
                capacity = self.data.len(),
                "Failed to lock secure buffer memory (may be swapped to disk)"
            );
        }
        self.locked
    }

    /// Returns whether the backing memory is locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes in use.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether no bytes are in use.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether no more bytes fit.
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// Append one byte.
    pub fn push(&mut self, byte: u8) -> Result<(), CapacityExceeded> {
        self.extend_from_slice(&[byte])
    }

    /// Append bytes, all or nothing.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), CapacityExceeded> {
        let end = self
            .len
            .checked_add(bytes.len())
            .filter(|end| *end <= self.data.len())
            .ok_or(CapacityExceeded {
                capacity: self.data.len(),
            })?;
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Shorten the buffer to `len` bytes, zeroing the removed tail.
    ///
    /// Does nothing if `len` is not shorter than the current length.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        self.data[len..self.len].zeroize();
        self.len = len;
    }

    /// Empty the buffer, zeroing what was in use.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Number of decoded UTF-8 characters.
    ///
    /// Invalid sequences count one character per byte, matching how
    /// [`SecureBuffer::pop_char`] steps over them.
    pub fn char_count(&self) -> usize {
        let bytes = self.as_bytes();
        let mut pos = 0;
        let mut count = 0;
        while pos < bytes.len() {
            pos += char_len(&bytes[pos..]);
            count += 1;
        }
        count
    }

    /// Remove the last decoded character.
    ///
    /// Scans from the start so a multi-byte character is always removed
    /// whole. Returns whether anything was removed.
    pub fn pop_char(&mut self) -> bool {
        if self.len == 0 {
            return false;
        }
        let mut prev = 0;
        let mut pos = 0;
        {
            let bytes = self.as_bytes();
            while pos < bytes.len() {
                prev = pos;
                pos += char_len(&bytes[pos..]);
            }
        }
        self.truncate(prev);
        prev.zeroize();
        pos.zeroize();
        true
    }

    /// The bytes in use.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl ExposeSecret<[u8]> for SecureBuffer {
    fn expose_secret(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
        self.len = 0;
        if self.locked && !self.data.is_empty() {
            // Safety: same region that was locked in try_lock.
            unsafe {
                memsec::munlock(self.data.as_mut_ptr(), self.data.len());
            }
        }
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("data", &"[REDACTED]")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .field("locked", &self.locked)
            .finish()
    }
}

/// Length of the UTF-8 sequence starting at `bytes[0]`.
///
/// Returns 1 for a stray continuation byte, an invalid lead byte, or a
/// sequence cut short, so a scan over arbitrary bytes always advances.
pub(crate) fn char_len(bytes: &[u8]) -> usize {
    let Some(&lead) = bytes.first() else {
        return 0;
    };
    let want = match lead {
        0x00..=0x7F => return 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return 1,
    };
    if bytes.len() < want {
        return 1;
    }
    if bytes[1..want].iter().all(|b| b & 0xC0 == 0x80) {
        want
    } else {
        1
    }
}

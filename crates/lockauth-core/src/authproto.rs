//! Packet framing between the UI process and the checking process.
//!
//! Two unidirectional byte streams connect the processes: requests flow from
//! the checking process to the UI, responses flow back. Each stream carries a
//! sequence of packets in the same format.
//!
//! Wire format:
//! ```text
//! +-----------+------------------+-------------------+
//! | TYPE (1B) | LENGTH (4B BE)   | PAYLOAD (N bytes) |
//! +-----------+------------------+-------------------+
//! ```
//!
//! There is no terminator packet on the wire: the end of a stream (zero bytes
//! where a type byte was expected) or a zero type byte reads as
//! [`PacketType::Eof`]. Payloads are arbitrary bytes; UTF-8 is expected for
//! text but never validated here.
//!
//! A stream that closes in the middle of a packet is an error. The channel
//! never tries to resynchronize after one.

use std::fmt;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};

use secrecy::SecretSlice;
use thiserror::Error;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::checker::ConversationError;
use crate::traits::Conversation;

/// Maximum payload length accepted on either side.
///
/// Larger payloads are rejected, never truncated.
pub const MAX_PAYLOAD_LENGTH: usize = 64 * 1024;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors from reading or writing packets.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Failed to read from or write to the stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended where a packet was required.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The stream ended in the middle of a packet.
    #[error("stream closed mid-packet ({got} of {expected} bytes)")]
    Truncated {
        /// Bytes the packet still needed.
        expected: usize,
        /// Bytes actually received.
        got: usize,
    },

    /// The payload is larger than [`MAX_PAYLOAD_LENGTH`].
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The type byte is not a known packet type. The payload was consumed.
    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// A valid packet arrived where a different kind was required.
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(PacketType),
}

/// Packet type discriminator.
///
/// The values are ASCII letters so a captured stream is easy to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Informational message for the user.
    InfoMessage = b'i',
    /// Error message for the user.
    ErrorMessage = b'e',
    /// Prompt whose answer may be shown while typing (usernames).
    PromptEcho = b'U',
    /// Prompt whose answer must be hidden (passwords).
    PromptHidden = b'P',
    /// Answer to [`PacketType::PromptEcho`].
    ResponseEcho = b'u',
    /// Answer to [`PacketType::PromptHidden`].
    ResponseHidden = b'p',
    /// The user cancelled the prompt or it timed out.
    ResponseCancelled = b'x',
    /// End of stream. Never written on the wire.
    Eof = 0,
}

impl PacketType {
    /// Parse a packet type from its tag byte.
    ///
    /// Returns `None` for unknown tags. `0` parses as [`PacketType::Eof`].
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'i' => Some(Self::InfoMessage),
            b'e' => Some(Self::ErrorMessage),
            b'U' => Some(Self::PromptEcho),
            b'P' => Some(Self::PromptHidden),
            b'u' => Some(Self::ResponseEcho),
            b'p' => Some(Self::ResponseHidden),
            b'x' => Some(Self::ResponseCancelled),
            0 => Some(Self::Eof),
            _ => None,
        }
    }

    /// Convert to the tag byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Returns whether packets of this type carry a secret payload.
    pub fn is_secret(self) -> bool {
        matches!(self, Self::ResponseEcho | Self::ResponseHidden)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::InfoMessage => write!(f, "info_message"),
            PacketType::ErrorMessage => write!(f, "error_message"),
            PacketType::PromptEcho => write!(f, "prompt_echo"),
            PacketType::PromptHidden => write!(f, "prompt_hidden"),
            PacketType::ResponseEcho => write!(f, "response_echo"),
            PacketType::ResponseHidden => write!(f, "response_hidden"),
            PacketType::ResponseCancelled => write!(f, "response_cancelled"),
            PacketType::Eof => write!(f, "eof"),
        }
    }
}

/// A decoded packet.
///
/// The payload buffer is sized exactly to the payload and zeroed on drop.
pub struct Packet {
    kind: PacketType,
    payload: Zeroizing<Vec<u8>>,
}

impl Packet {
    /// The end-of-stream packet.
    pub fn eof() -> Self {
        Self {
            kind: PacketType::Eof,
            payload: Zeroizing::new(Vec::new()),
        }
    }

    /// Packet type.
    pub fn kind(&self) -> PacketType {
        self.kind
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as text, replacing invalid UTF-8.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Move the payload into a secret without copying it.
    pub fn into_secret(self) -> SecretSlice<u8> {
        let mut payload = self.payload;
        SecretSlice::from(std::mem::take(&mut *payload))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Packet");
        s.field("kind", &self.kind);
        if self.kind.is_secret() {
            s.field("payload", &"[REDACTED]");
        } else {
            s.field("payload", &String::from_utf8_lossy(&self.payload));
        }
        s.finish()
    }
}

/// Write one packet and flush the stream.
///
/// Writing [`PacketType::Eof`] writes nothing; the stream end is signalled
/// by closing it.
///
/// # Errors
///
/// Returns `PayloadTooLarge` without writing anything if the payload exceeds
/// [`MAX_PAYLOAD_LENGTH`], or `Io` if the stream fails.
pub fn write_packet<W: Write + ?Sized>(
    stream: &mut W,
    kind: PacketType,
    payload: &[u8],
) -> Result<(), ChannelError> {
    if kind == PacketType::Eof {
        return Ok(());
    }
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(ChannelError::PayloadTooLarge(payload.len()));
    }

    let len = payload.len() as u32;
    let mut header = [0u8; 1 + LENGTH_PREFIX_SIZE];
    header[0] = kind.to_byte();
    header[1..].copy_from_slice(&len.to_be_bytes());

    stream.write_all(&header)?;
    stream.write_all(payload)?;
    stream.flush()?;

    trace!(kind = %kind, len = payload.len(), "Packet written");
    Ok(())
}

/// Read one packet, blocking until it is complete.
///
/// With `allow_eof`, a stream that ends cleanly before a packet starts
/// yields [`PacketType::Eof`]; without it, that is `UnexpectedEof`.
///
/// # Errors
///
/// - `UnexpectedEof` if the stream ended and `allow_eof` is false
/// - `Truncated` if the stream ended mid-packet
/// - `PayloadTooLarge` if the length prefix exceeds [`MAX_PAYLOAD_LENGTH`]
/// - `UnknownPacketType` if the tag is unknown (its payload is consumed)
pub fn read_packet<R: Read + ?Sized>(
    stream: &mut R,
    allow_eof: bool,
) -> Result<Packet, ChannelError> {
    let mut tag = [0u8; 1];
    let got = read_full(stream, &mut tag)?;
    if got == 0 {
        return eof_or_error(allow_eof);
    }

    let kind = PacketType::from_byte(tag[0]);
    if kind == Some(PacketType::Eof) {
        return eof_or_error(allow_eof);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let got = read_full(stream, &mut prefix)?;
    if got < prefix.len() {
        return Err(ChannelError::Truncated {
            expected: prefix.len(),
            got,
        });
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_PAYLOAD_LENGTH {
        warn!(len, "Rejecting oversized packet");
        return Err(ChannelError::PayloadTooLarge(len));
    }

    let mut payload = Zeroizing::new(vec![0u8; len]);
    let got = read_full(stream, &mut payload)?;
    if got < len {
        return Err(ChannelError::Truncated { expected: len, got });
    }

    match kind {
        Some(kind) => {
            trace!(kind = %kind, len, "Packet read");
            Ok(Packet { kind, payload })
        }
        None => Err(ChannelError::UnknownPacketType(tag[0])),
    }
}

fn eof_or_error(allow_eof: bool) -> Result<Packet, ChannelError> {
    if allow_eof {
        debug!("End of packet stream");
        Ok(Packet::eof())
    } else {
        Err(ChannelError::UnexpectedEof)
    }
}

/// Fill `buf` from the stream, stopping early only at end of stream.
///
/// Returns the number of bytes read.
fn read_full<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// The checking process's side of the conversation.
///
/// Every step is written to `requests` as a packet; prompts then block on
/// the matching packet from `responses`. Only one request is ever in flight.
pub struct ChannelConversation<W, R> {
    requests: W,
    responses: R,
}

impl<W: Write, R: Read> ChannelConversation<W, R> {
    /// Create a conversation over the given streams.
    pub fn new(requests: W, responses: R) -> Self {
        Self {
            requests,
            responses,
        }
    }

    /// Give back the underlying streams.
    pub fn into_inner(self) -> (W, R) {
        (self.requests, self.responses)
    }
}

impl ChannelConversation<File, File> {
    /// Converse over duplicates of this process's stdout and stdin.
    ///
    /// Both streams are unbuffered: response payloads go straight from the
    /// pipe into their packet and exist nowhere else in this process.
    pub fn stdio() -> io::Result<Self> {
        let requests = io::stdout().as_fd().try_clone_to_owned()?;
        let responses = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::from_fds(requests, responses))
    }

    /// Converse over the given descriptors, unbuffered.
    pub fn from_fds(requests: OwnedFd, responses: OwnedFd) -> Self {
        Self::new(File::from(requests), File::from(responses))
    }
}

impl<W: Write, R: Read> Conversation for ChannelConversation<W, R> {
    fn prompt(
        &mut self,
        message: &[u8],
        echo: bool,
    ) -> Result<SecretSlice<u8>, ConversationError> {
        let kind = if echo {
            PacketType::PromptEcho
        } else {
            PacketType::PromptHidden
        };
        write_packet(&mut self.requests, kind, message)?;

        let reply = read_packet(&mut self.responses, false)?;
        match reply.kind() {
            PacketType::ResponseEcho | PacketType::ResponseHidden => Ok(reply.into_secret()),
            PacketType::ResponseCancelled => {
                debug!("Prompt cancelled by user");
                Err(ConversationError::Cancelled)
            }
            other => {
                warn!(kind = %other, "Unexpected reply to prompt");
                Err(ChannelError::UnexpectedPacket(other).into())
            }
        }
    }

    fn alert(&mut self, message: &[u8], is_error: bool) -> Result<(), ConversationError> {
        let kind = if is_error {
            PacketType::ErrorMessage
        } else {
            PacketType::InfoMessage
        };
        write_packet(&mut self.requests, kind, message)?;
        Ok(())
    }
}

impl<W, R> fmt::Debug for ChannelConversation<W, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConversation").finish_non_exhaustive()
    }
}

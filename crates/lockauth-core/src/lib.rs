//! Core authentication flow for the lockauth screen-lock helper.
//!
//! This crate holds everything between "the screen is locked" and "the user
//! proved who they are". It is intentionally display-agnostic so that:
//!
//! - Security audits can focus on the credential-handling modules
//! - Unit tests run without a display server or a PAM stack
//! - Different renderers (terminal, X11, Wayland) can be plugged in
//!
//! # Architecture
//!
//! Two processes cooperate. The UI process runs a [`SessionSupervisor`],
//! which spawns the checking process and serves its conversation requests.
//! The checking process runs a [`CredentialChecker`] whose conversation
//! steps travel over the [`authproto`] framed channel. Prompts are answered
//! by the [`PromptEngine`], which keeps the typed secret in a
//! [`SecureBuffer`].
//!
//! # Modules
//!
//! - [`secure_buffer`]: Fixed-capacity, pinned, zero-on-drop byte buffer
//! - [`authproto`]: Packet framing between the two processes
//! - [`prompt`]: Keystroke-driven password entry state machine
//! - [`checker`]: Conversation driver and retry policy over a backend
//! - [`supervisor`]: Spawning, serving and reaping the checking process
//! - [`traits`]: Collaborator traits (`Renderer`, `LayoutSwitcher`, `Clock`, `MemoryPinner`)
//! - [`types`]: Shared data types (`AuthStatus`, `Identity`, `Verdict`)
//! - [`config`]: TOML configuration
//! - [`mock`]: Test doubles for the collaborator traits and the backend
//!
//! # Example
//!
//! ```
//! use lockauth_core::authproto::{read_packet, write_packet, PacketType};
//!
//! let mut wire = Vec::new();
//! write_packet(&mut wire, PacketType::PromptHidden, b"Password:").unwrap();
//!
//! let packet = read_packet(&mut wire.as_slice(), false).unwrap();
//! assert_eq!(packet.kind(), PacketType::PromptHidden);
//! assert_eq!(packet.payload(), b"Password:");
//! ```

pub mod authproto;
pub mod checker;
pub mod config;
pub mod mock;
pub mod prompt;
pub mod secure_buffer;
pub mod supervisor;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root for convenience
pub use authproto::{ChannelConversation, ChannelError, Packet, PacketType};
pub use checker::{
    AuthBackend, ConversationError, ConverseError, Converser, CredentialChecker, RetryPolicy,
    SharedConverser, Step, StepKind,
};
pub use config::{Config, ConfigError};
pub use prompt::{CancelReason, KeyboardInput, PromptEngine, PromptOutcome, PromptSettings};
pub use secure_buffer::{CapacityExceeded, SecureBuffer};
pub use supervisor::{install_signal_forwarding, ChildProcess, SessionSupervisor, SupervisorError};
pub use traits::{
    Clock, Conversation, KeySource, LayoutSwitcher, MemoryPinner, MlockPinner, NoOpLayoutSwitcher,
    Renderer, SystemClock,
};
pub use types::{AuthStatus, DisplayMode, Identity, PasswordDisplay, Verdict};

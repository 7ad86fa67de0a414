//! Configuration types and loading for lockauth.
//!
//! Configuration is loaded from `~/.config/lockauth/config.toml`.
//!
//! # Error Handling
//!
//! - If the config file doesn't exist, default values are returned.
//! - If the config file exists but is invalid, an error is returned (fail fast).
//!
//! # Example Configuration
//!
//! ```toml
//! [prompt]
//! timeout = 300                # seconds of inactivity before a prompt gives up
//! password_display = "cursor"  # cursor | asterisks | hidden
//! alert_pause_ms = 1000        # how long backend messages stay up
//!
//! [auth]
//! authproto = "/usr/libexec/lockauth/lockauth-authproto"
//! pam_service = "lockauth"
//! max_attempts = 3
//! strict_account_check = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::checker::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::prompt::{PromptSettings, MAX_TIMEOUT, MAX_TIMEOUT_SECS, MIN_ALERT_PAUSE};
use crate::types::PasswordDisplay;

/// Default checking-process executable.
pub const DEFAULT_AUTHPROTO: &str = "/usr/libexec/lockauth/lockauth-authproto";

/// Default PAM service name.
pub const DEFAULT_PAM_SERVICE: &str = "lockauth";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The prompt timeout is longer than [`MAX_TIMEOUT_SECS`].
    #[error("Prompt timeout of {0} seconds is out of range (at most one year)")]
    TimeoutOutOfRange(u64),
}

/// Main configuration struct.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Prompt configuration.
    pub prompt: PromptConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
}

/// Configuration for password prompts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Inactivity timeout in seconds (default: 300).
    pub timeout: u64,
    /// How hidden input is displayed. Overrides `paranoid_password`.
    pub password_display: Option<PasswordDisplay>,
    /// Legacy switch: `true` selects `cursor`, `false` selects `asterisks`.
    pub paranoid_password: Option<bool>,
    /// How long backend messages stay on screen, in milliseconds.
    ///
    /// Values below 1000 are raised to 1000.
    pub alert_pause_ms: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            timeout: 300, // 5 minutes
            password_display: None,
            paranoid_password: None,
            alert_pause_ms: 1000,
        }
    }
}

impl PromptConfig {
    /// The hidden-input display mode after applying the legacy switch.
    pub fn effective_password_display(&self) -> PasswordDisplay {
        match (self.password_display, self.paranoid_password) {
            (Some(display), _) => display,
            (None, Some(true)) => PasswordDisplay::Cursor,
            (None, Some(false)) => PasswordDisplay::Asterisks,
            (None, None) => PasswordDisplay::default(),
        }
    }
}

/// Configuration for the checking process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Path of the checking-process executable.
    pub authproto: PathBuf,
    /// PAM service name.
    pub pam_service: String,
    /// Attempts per backend operation (default: 3, at least 1).
    pub max_attempts: u32,
    /// Whether a failed account check fails the session (default: true).
    pub strict_account_check: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authproto: PathBuf::from(DEFAULT_AUTHPROTO),
            pam_service: DEFAULT_PAM_SERVICE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            strict_account_check: true,
        }
    }
}

impl AuthConfig {
    /// The retry policy described by this section.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.strict_account_check)
    }
}

impl Config {
    /// Returns the default configuration file path.
    ///
    /// Returns `~/.config/lockauth/config.toml` using `dirs::config_dir()`,
    /// or `None` if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("lockauth").join("config.toml"))
    }

    /// Load configuration from the default path.
    ///
    /// - Returns `Ok(Config::default())` if no config file exists.
    /// - Returns `Err` if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    ///
    /// Returns an error if the file cannot be read, cannot be parsed, or
    /// holds an out-of-range value.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prompt.timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::TimeoutOutOfRange(self.prompt.timeout));
        }
        Ok(())
    }

    /// Prompt engine settings derived from the `[prompt]` section.
    pub fn prompt_settings(&self) -> PromptSettings {
        PromptSettings {
            timeout: Duration::from_secs(self.prompt.timeout).min(MAX_TIMEOUT),
            password_display: self.prompt.effective_password_display(),
            alert_pause: Duration::from_millis(self.prompt.alert_pause_ms).max(MIN_ALERT_PAUSE),
            ..PromptSettings::default()
        }
    }
}

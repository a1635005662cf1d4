//! TOML configuration for the tutorial application.
//!
//! ```toml
//! log_level = "info"
//!
//! [connection]
//! endpoint = "rtm://localhost:6580"
//! app_key = "YOUR_APPKEY"
//!
//! [auth]            # optional; omit to skip authentication
//! role = "publisher"
//! secret = "..."
//!
//! [demo]
//! channel = "animals"
//! cycles = 3
//! ```
//!
//! Every field has a default (see the `default_*` helpers), so a partial
//! file, or no file at all, still yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rtm_core::{ClientOptions, Credentials};
use serde::Deserialize;
use thiserror::Error;

/// File read when no path is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "rtm-tutorial.toml";

/// Role shipped in the sample file; treated as "no credentials".
pub const PLACEHOLDER_ROLE: &str = "YOUR_ROLE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TutorialConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Role credentials; absent means the session stays unauthenticated.
    #[serde(default)]
    pub auth: Option<Credentials>,
    #[serde(default)]
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_app_key")]
    pub app_key: String,
    /// Deadline for each blocking request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// The publish/echo loop.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DemoConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Published verbatim; JSON text is not parsed.
    #[serde(default = "default_message")]
    pub message: String,
    /// Idle wait between cycles, in seconds.
    #[serde(default = "default_cycle_pause_secs")]
    pub cycle_pause_secs: u64,
    /// Number of publish/echo cycles; 0 loops forever.
    #[serde(default)]
    pub cycles: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_endpoint() -> String {
    "rtm://localhost:6580".to_string()
}
fn default_app_key() -> String {
    "YOUR_APPKEY".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_channel() -> String {
    "animals".to_string()
}
fn default_message() -> String {
    r#"{"who": "zebra", "where": [34.134358, -118.321506]}"#.to_string()
}
fn default_cycle_pause_secs() -> u64 {
    2
}

impl Default for TutorialConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            connection: ConnectionConfig::default(),
            auth: None,
            demo: DemoConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            app_key: default_app_key(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            message: default_message(),
            cycle_pause_secs: default_cycle_pause_secs(),
            cycles: 0,
        }
    }
}

impl TutorialConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.request_timeout_secs)
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_secs(self.demo.cycle_pause_secs)
    }

    /// Credentials to authenticate with, or `None` when the `[auth]` table is
    /// absent or still names [`PLACEHOLDER_ROLE`].
    pub fn credentials(&self) -> Option<&Credentials> {
        self.auth
            .as_ref()
            .filter(|credentials| credentials.role != PLACEHOLDER_ROLE)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: self.request_timeout(),
            ..ClientOptions::default()
        }
    }
}

/// Loads the configuration at `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<TutorialConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TutorialConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

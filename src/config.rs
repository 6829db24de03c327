//! Daemon configuration parameters
//!
//! Tunables of the `growctld` process itself, as opposed to the entity
//! snapshot (relays, zones, controllers, rules, timers) which lives in its
//! own file and can be reloaded at runtime.  Every field has a default, so
//! an empty JSON object is a valid config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app::ports::ConfigError;

/// Which pin driver the daemon uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinBackend {
    /// Linux sysfs GPIO (`/sys/class/gpio`).
    Sysfs,
    /// In-memory pins; logs levels only.
    Simulated,
}

/// SMTP relay used for rule notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS (SMTPS).  When false the session uses STARTTLS.
    pub ssl: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Sender address
    pub from: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 587,
            ssl: false,
            user: None,
            password: None,
            from: "growctl@localhost".into(),
        }
    }
}

/// Core daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    // --- Files ---
    /// Entity snapshot (JSON).
    pub snapshot_path: PathBuf,
    /// Unix socket for the control line protocol.
    pub socket_path: PathBuf,

    // --- Hardware ---
    pub pin_backend: PinBackend,
    /// Root of the sysfs GPIO tree.
    pub gpio_root: PathBuf,

    // --- Rules ---
    /// Timeout for rule `command` actions (seconds)
    pub command_timeout_secs: u64,
    /// Notifications allowed per hour across all rules (0 = unlimited)
    pub notify_max_per_hour: u32,
    /// Relay-transition rule cascade limit
    pub max_cascade_depth: u8,
    /// SMTP relay for notifications; `None` logs them instead.
    pub smtp: Option<SmtpConfig>,

    // --- Timing ---
    /// A reading older than zone period × this is reported stale
    pub stale_factor: u32,
    /// Auto-off deadline service interval (milliseconds)
    pub deadline_resolution_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            // Files
            snapshot_path: PathBuf::from("/etc/growctl/snapshot.json"),
            socket_path: PathBuf::from("/run/growctl/control.sock"),

            // Hardware
            pin_backend: PinBackend::Sysfs,
            gpio_root: PathBuf::from("/sys/class/gpio"),

            // Rules
            command_timeout_secs: 30,
            notify_max_per_hour: 10,
            max_cascade_depth: 8,
            smtp: None,

            // Timing
            stale_factor: 3,
            deadline_resolution_ms: 100, // 10 Hz
        }
    }
}

impl DaemonConfig {
    /// Read a JSON config file.  Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound,
            _ => ConfigError::Io(e.to_string()),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Malformed(e.to_string()))
    }
}

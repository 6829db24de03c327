//! Port traits — the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ ControlCore (domain)
//! ```
//!
//! Driven adapters (GPIO, shell, mail, config file, event sinks) implement
//! these traits.  The [`ControlCore`](super::service::ControlCore) consumes
//! them via generics, so the domain core never touches hardware directly.
//!
//! ## Contract notes
//!
//! - **PinDriver** is only ever called by the arbitrator.  Levels are
//!   physical; polarity has already been applied.
//! - **CommandRunner** must enforce the timeout itself and never block the
//!   caller while the command runs.
//! - All port errors are typed; callers must handle every variant explicitly.

use core::time::Duration;

use crate::error::{CommandError, NotifyError, PinError};
use crate::snapshot::Snapshot;

// ───────────────────────────────────────────────────────────────
// Pin driver (driven adapter: domain → hardware)
// ───────────────────────────────────────────────────────────────

/// Write-side port for relay GPIO lines.
pub trait PinDriver {
    /// Drive `pin` to the physical `level` (true = high).
    fn write(&mut self, pin: u8, level: bool) -> Result<(), PinError>;

    /// The pin is no longer used by any actuator.
    fn release(&mut self, _pin: u8) {}
}

impl<T: PinDriver + ?Sized> PinDriver for Box<T> {
    fn write(&mut self, pin: u8, level: bool) -> Result<(), PinError> {
        (**self).write(pin, level)
    }

    fn release(&mut self, pin: u8) {
        (**self).release(pin);
    }
}

// ───────────────────────────────────────────────────────────────
// Clock
// ───────────────────────────────────────────────────────────────

/// Monotonic millisecond clock.  Never goes backwards.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

// ───────────────────────────────────────────────────────────────
// Command execution (rule `command` actions)
// ───────────────────────────────────────────────────────────────

/// Launches rule commands.
///
/// `run` returns once the command is started; the adapter supervises it,
/// kills it when `timeout` elapses and logs its exit status.  The control
/// thread is never blocked for the lifetime of a command.
pub trait CommandRunner {
    fn run(&mut self, command: &str, timeout: Duration) -> Result<(), CommandError>;
}

// ───────────────────────────────────────────────────────────────
// Notification transport (rule `notify` actions)
// ───────────────────────────────────────────────────────────────

/// Delivers rule notifications.  `send` must not block on the network.
pub trait Notifier {
    fn send(
        &mut self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

impl<T: Notifier + ?Sized> Notifier for Box<T> {
    fn send(
        &mut self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        (**self).send(recipients, subject, body)
    }
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`CoreEvent`](super::events::CoreEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::CoreEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: configuration store → domain)
// ───────────────────────────────────────────────────────────────

/// Loads the entity snapshot.
///
/// Implementations return the snapshot as stored; validation of individual
/// entities happens in [`Snapshot::sanitize`] so one bad row never hides
/// the rest.
pub trait ConfigPort {
    fn load(&self) -> Result<Snapshot, ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No snapshot exists at the configured location.
    NotFound,
    /// The store could not be read.
    Io(String),
    /// The stored snapshot is not a valid document.
    Malformed(String),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "snapshot not found"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Malformed(msg) => write!(f, "malformed snapshot: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

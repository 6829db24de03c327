//! Unified error types for the control core.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! supervisor's error handling uniform.  Most variants are `Copy` so they can
//! be passed through the arbitrator, loops and rule engine without allocation.
//!
//! Nothing in this taxonomy is process-fatal: the only fatal condition is
//! failing to load the initial snapshot, which the binary reports itself.

use core::fmt;

use crate::snapshot::{EntityKind, RelayId, Variable, ZoneId};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the core funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A snapshot entity failed validation and was skipped.
    Config(ConfigInvalid),
    /// The arbitrator refused or failed a relay request.
    Arbitration(ArbitrationError),
    /// A cached reading is older than its allowed age (advisory).
    StaleReading(StaleReading),
    /// An external command could not be run to completion.
    Command(CommandError),
    /// A notification could not be handed to the transport.
    Notify(NotifyError),
    /// Referenced an entity the running core does not know.
    UnknownEntity { kind: EntityKind, id: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Arbitration(e) => write!(f, "relay: {e}"),
            Self::StaleReading(e) => write!(f, "reading: {e}"),
            Self::Command(e) => write!(f, "command: {e}"),
            Self::Notify(e) => write!(f, "notify: {e}"),
            Self::UnknownEntity { kind, id } => write!(f, "unknown {kind} {id}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// A malformed snapshot entity.  The entity is skipped, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigInvalid {
    pub kind: EntityKind,
    pub id: u32,
    pub reason: &'static str,
}

impl fmt::Display for ConfigInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} invalid: {}", self.kind, self.id, self.reason)
    }
}

impl From<ConfigInvalid> for Error {
    fn from(e: ConfigInvalid) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Arbitration errors
// ---------------------------------------------------------------------------

/// Why the arbitrator did not grant a request.
///
/// `AlreadyInState` is a no-op rather than a failure; callers usually
/// ignore it.  `BudgetExceeded` and `MinOffPending` are recoverable
/// contention conditions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArbitrationError {
    /// No actuator with this id is registered.
    UnknownActuator(RelayId),
    /// Granting the request would push the total draw over the ceiling.
    BudgetExceeded {
        relay: RelayId,
        load_amps: f32,
        request_amps: f32,
        ceiling_amps: f32,
    },
    /// The actuator is already in the requested state.
    AlreadyInState(RelayId),
    /// The actuator has not been off for the requested minimum.
    MinOffPending { relay: RelayId, remaining_ms: u64 },
    /// The pin driver failed; the actuator is now in `Unknown` state.
    PinDriver(PinError),
}

impl ArbitrationError {
    /// `AlreadyInState` is not an error from the caller's point of view.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::AlreadyInState(_))
    }
}

impl fmt::Display for ArbitrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownActuator(id) => write!(f, "relay {id} does not exist"),
            Self::BudgetExceeded {
                relay,
                load_amps,
                request_amps,
                ceiling_amps,
            } => write!(
                f,
                "relay {relay} would draw {:.2}A on top of {:.2}A, ceiling is {:.2}A",
                request_amps, load_amps, ceiling_amps
            ),
            Self::AlreadyInState(id) => write!(f, "relay {id} already in requested state"),
            Self::MinOffPending { relay, remaining_ms } => write!(
                f,
                "relay {relay} minimum off period not reached ({remaining_ms} ms left)"
            ),
            Self::PinDriver(e) => write!(f, "{e}"),
        }
    }
}

impl From<ArbitrationError> for Error {
    fn from(e: ArbitrationError) -> Self {
        Self::Arbitration(e)
    }
}

/// GPIO write failure reported by a [`PinDriver`](crate::app::ports::PinDriver).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinError {
    pub pin: u8,
    pub kind: PinErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinErrorKind {
    /// The pin could not be claimed/exported.
    Unavailable,
    /// Writing the level failed.
    WriteFailed,
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PinErrorKind::Unavailable => write!(f, "GPIO {} unavailable", self.pin),
            PinErrorKind::WriteFailed => write!(f, "GPIO {} write failed", self.pin),
        }
    }
}

impl From<PinError> for ArbitrationError {
    fn from(e: PinError) -> Self {
        Self::PinDriver(e)
    }
}

// ---------------------------------------------------------------------------
// Reading errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleReading {
    pub zone: ZoneId,
    pub variable: Variable,
    pub age_ms: u64,
    pub max_age_ms: u64,
}

impl fmt::Display for StaleReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zone {} {} is {} ms old (limit {} ms)",
            self.zone, self.variable, self.age_ms, self.max_age_ms
        )
    }
}

impl From<StaleReading> for Error {
    fn from(e: StaleReading) -> Self {
        Self::StaleReading(e)
    }
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The process could not be started.
    SpawnFailed(String),
    /// The process outlived its timeout and was killed.
    Timeout { command: String, timeout_ms: u64 },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed(msg) => write!(f, "spawn failed: {msg}"),
            Self::Timeout {
                command,
                timeout_ms,
            } => write!(f, "'{command}' timed out after {timeout_ms} ms"),
        }
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// No recipients were given.
    NoRecipients,
    /// The transport refused or failed the message.
    Transport(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRecipients => write!(f, "no recipients"),
            Self::Transport(msg) => write!(f, "transport failed: {msg}"),
        }
    }
}

impl From<NotifyError> for Error {
    fn from(e: NotifyError) -> Self {
        Self::Notify(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

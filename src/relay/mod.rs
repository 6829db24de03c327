//! Relay actuation: state table and the arbitrator in front of it.
//!
//! ```text
//!   PID loops ─┐
//!   Rules ─────┼──▶ Arbitrator ──▶ RelayStateTable
//!   Timers ────┤      │  budget          │
//!   Manual ────┘      │  audit ring      ▼
//!                     │             PinDriver (polarity applied)
//!                     ▼
//!              RelayTransition queue ──▶ relay-transition rules
//! ```
//!
//! The arbitrator is the only code that writes pins.

pub mod arbitrator;
pub mod table;

use core::fmt;

use crate::snapshot::{PidId, RelayId, RuleId, Switch, TimerId};

pub use arbitrator::{Arbitrator, Granted, RelayRequest};
pub use table::{RelaySlot, RelayStateTable};

/// Logical state of an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Off,
    On,
    /// A pin write failed; the physical state cannot be trusted.
    Unknown,
}

impl RelayState {
    /// `On` and `Unknown` both count against the current budget.
    pub fn draws_current(self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl From<Switch> for RelayState {
    fn from(s: Switch) -> Self {
        match s {
            Switch::On => Self::On,
            Switch::Off => Self::Off,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Unknown => "unknown",
        })
    }
}

/// Who asked for a relay change.  Carried into the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Manual,
    Pid(PidId),
    Rule(RuleId),
    Timer(TimerId),
    /// Auto-off deadline expiry.
    Deadline,
    /// Startup, shutdown, reload teardown, pre-measurement.
    Lifecycle,
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Pid(id) => write!(f, "pid {id}"),
            Self::Rule(id) => write!(f, "rule {id}"),
            Self::Timer(id) => write!(f, "timer {id}"),
            Self::Deadline => f.write_str("deadline"),
            Self::Lifecycle => f.write_str("lifecycle"),
        }
    }
}

/// A physical on/off edge, as seen by relay-transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTransition {
    pub relay: RelayId,
    pub state: Switch,
    pub at_ms: u64,
    /// For `On`: requested duration (0 = indefinite).
    /// For `Off`: how long the relay had been on.
    pub duration_ms: u64,
    pub requester: Requester,
}

/// One accepted change, kept in the bounded audit ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp_ms: u64,
    pub relay: RelayId,
    pub state: RelayState,
    /// Requested on-duration (0 = indefinite or not applicable).
    pub requested_ms: u64,
    /// Completed on-interval, recorded on the off edge.
    pub completed_on_ms: Option<u64>,
    pub requester: Requester,
}

//! Outbound core events.
//!
//! The [`ControlCore`](super::service::ControlCore) emits these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them: log them, append them to a history
//! store, push them to a dashboard.

use crate::control::CycleOutcome;
use crate::error::ConfigInvalid;
use crate::relay::{AuditRecord, RelayTransition};
use crate::rules::{FiringCause, FiringReport};
use crate::scheduler::Phase;
use crate::snapshot::{PidId, RelayId, RuleId, TimerId};

/// Structured events emitted by the control core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// The core converged on its first snapshot.
    Started(Census),

    /// A later snapshot was applied.
    Reloaded {
        census: Census,
        started: usize,
        stopped: usize,
    },

    /// A snapshot entity was skipped.
    ConfigRejected(ConfigInvalid),

    /// A relay physically changed state.
    Transition(RelayTransition),

    /// An arbitrator audit record.
    Audit(AuditRecord),

    /// One PID sample period completed.
    PidCycle { pid: PidId, outcome: CycleOutcome },

    /// A rule ran its actions.
    RuleFired {
        rule: RuleId,
        cause: FiringCause,
        report: FiringReport,
    },

    /// A rule-triggered transition was not propagated further.
    CascadeDropped { relay: RelayId, depth: u8 },

    /// A duty-cycle timer changed phase.
    TimerPhase { timer: TimerId, phase: Phase },

    /// Every relay was switched off and the core stopped.
    ShutDown,
}

/// How many entities of each kind are running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Census {
    pub relays: usize,
    pub pids: usize,
    pub rules: usize,
    pub timers: usize,
}

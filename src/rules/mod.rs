//! Conditional automation rules.
//!
//! Two trigger kinds:
//!
//! - **Threshold**: polled on the rule's own period against the reading
//!   cache.  Fires on *every* tick the comparison holds; there is no edge
//!   detection, so a rule that should act once must be written to be
//!   idempotent (or rely on the notification throttle).
//! - **Relay transition**: matched against every transition the arbitrator
//!   reports.  An `on_duration_secs` of 0 matches any duration, otherwise
//!   the transition duration must agree within
//!   [`ON_DURATION_TOLERANCE_MS`] (inclusive).
//!
//! Firing runs the rule's actions in declared order, see [`actions`].

pub mod actions;

use core::fmt;

use log::debug;

use crate::cache::ReadingCache;
use crate::relay::RelayTransition;
use crate::snapshot::{secs_to_ms, Comparison, RuleConfig, RuleId, Trigger, Variable, ZoneId};

pub use actions::{fire, ActionContext, FiringReport, NotifyThrottle, Throttled};

/// Slack allowed when matching a transition's duration.
pub const ON_DURATION_TOLERANCE_MS: u64 = 500;

/// Why a rule fired.  Feeds command placeholders and notification bodies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FiringCause {
    Threshold {
        zone: ZoneId,
        variable: Variable,
        value: f32,
    },
    Transition(RelayTransition),
}

impl fmt::Display for FiringCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threshold {
                zone,
                variable,
                value,
            } => write!(f, "zone {zone} {variable} is {value:.2}"),
            Self::Transition(t) => write!(
                f,
                "relay {} turned {} ({:.1} s)",
                t.relay,
                t.state,
                t.duration_ms as f64 / 1000.0
            ),
        }
    }
}

/// A configured rule plus its runtime bookkeeping.
#[derive(Debug, Clone)]
pub struct RuleRunner {
    config: RuleConfig,
    last_notify_ms: Option<u64>,
    fired: u64,
}

impl RuleRunner {
    pub fn new(config: RuleConfig) -> Self {
        Self {
            config,
            last_notify_ms: None,
            fired: 0,
        }
    }

    pub fn id(&self) -> RuleId {
        self.config.id
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stops (or resumes) future evaluation.  Actions already issued stand.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn fired_count(&self) -> u64 {
        self.fired
    }

    /// Polling period for threshold rules; `None` for event-driven rules.
    pub fn period_ms(&self) -> Option<u64> {
        match self.config.trigger {
            Trigger::Threshold { period_secs, .. } => Some(secs_to_ms(period_secs).max(1)),
            Trigger::RelayTransition { .. } => None,
        }
    }

    pub fn threshold_zone(&self) -> Option<ZoneId> {
        match self.config.trigger {
            Trigger::Threshold { zone, .. } => Some(zone),
            Trigger::RelayTransition { .. } => None,
        }
    }

    /// Check a threshold rule against the latest reading.
    pub fn evaluate_threshold(&self, cache: &ReadingCache) -> Option<FiringCause> {
        if !self.config.enabled {
            return None;
        }
        let Trigger::Threshold {
            zone,
            variable,
            comparison,
            setpoint,
            ..
        } = self.config.trigger
        else {
            return None;
        };
        let Some(reading) = cache.latest(zone, variable) else {
            debug!("Rule {}: no reading for zone {} {}", self.config.id, zone, variable);
            return None;
        };
        let holds = match comparison {
            Comparison::Above => reading.value > setpoint,
            Comparison::Below => reading.value < setpoint,
        };
        holds.then_some(FiringCause::Threshold {
            zone,
            variable,
            value: reading.value,
        })
    }

    /// Does this relay-transition rule react to `t`?
    pub fn matches_transition(&self, t: &RelayTransition) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Trigger::RelayTransition {
            relay,
            edge,
            on_duration_secs,
        } = self.config.trigger
        else {
            return false;
        };
        if relay != t.relay || edge != t.state {
            return false;
        }
        if on_duration_secs == 0 {
            return true;
        }
        let wanted_ms = u64::from(on_duration_secs) * 1000;
        wanted_ms.abs_diff(t.duration_ms) <= ON_DURATION_TOLERANCE_MS
    }
}

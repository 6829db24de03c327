//! Electrical safety budget.
//!
//! Every relay has a rated current draw.  The budget is checked by the
//! arbitrator **before every off→on transition** and rejects the request
//! when the sum of everything already drawing plus the newcomer would
//! exceed the ceiling.
//!
//! ## Accounting rules
//!
//! 1. Actuators in `On` state draw their rated amps.
//! 2. Actuators in `Unknown` state (pin write failed) are assumed to draw:
//!    the relay may be energised and we cannot prove otherwise.
//! 3. A request for an actuator that is already drawing is never rejected
//!    on budget grounds (deadline replacement does not add load).
//! 4. A disabled budget admits everything but still logs the load at
//!    debug level.
//! 5. A reload that changes the rated amps of a drawing actuator re-checks
//!    it; if it no longer fits it is switched off.

use log::{debug, info, warn};

use crate::error::ArbitrationError;
use crate::snapshot::{RelayId, SafetyBudget};

/// Float slack so that a load exactly at the ceiling is admitted.
const AMPS_EPSILON: f32 = 1e-4;

/// Current-draw ceiling shared by every actuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentBudget {
    ceiling_amps: f32,
    enabled: bool,
}

impl CurrentBudget {
    pub fn new(config: SafetyBudget) -> Self {
        Self {
            ceiling_amps: config.max_amps,
            enabled: config.enabled,
        }
    }

    /// A budget that admits every request.
    pub fn unlimited() -> Self {
        Self {
            ceiling_amps: f32::INFINITY,
            enabled: false,
        }
    }

    pub fn ceiling_amps(&self) -> f32 {
        self.ceiling_amps
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replace the ceiling (snapshot reload).  Never switches anything off:
    /// a lowered ceiling only constrains future on-transitions.
    pub fn update(&mut self, config: SafetyBudget) {
        if config.max_amps != self.ceiling_amps || config.enabled != self.enabled {
            info!(
                "Budget: ceiling {:.2}A -> {:.2}A ({})",
                self.ceiling_amps,
                config.max_amps,
                if config.enabled { "enforced" } else { "disabled" }
            );
        }
        self.ceiling_amps = config.max_amps;
        self.enabled = config.enabled;
    }

    /// Check whether `relay` drawing `request_amps` may join `load_amps`.
    pub fn admit(
        &self,
        relay: RelayId,
        load_amps: f32,
        request_amps: f32,
    ) -> Result<(), ArbitrationError> {
        let total = load_amps + request_amps;
        if !self.enabled {
            debug!(
                "Budget: disabled, admitting relay {} ({:.2}A + {:.2}A = {:.2}A)",
                relay, load_amps, request_amps, total
            );
            return Ok(());
        }
        if total > self.ceiling_amps + AMPS_EPSILON {
            warn!(
                "Budget: rejecting relay {} ({:.2}A + {:.2}A > {:.2}A)",
                relay, load_amps, request_amps, self.ceiling_amps
            );
            return Err(ArbitrationError::BudgetExceeded {
                relay,
                load_amps,
                request_amps,
                ceiling_amps: self.ceiling_amps,
            });
        }
        Ok(())
    }
}

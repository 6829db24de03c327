//! Relay actuation arbitrator.
//!
//! Every relay request from every requester funnels through
//! [`Arbitrator::request`].  It owns the pin driver, the state table and
//! the current budget, so a request is checked, written and recorded as
//! one step with nothing interleaved.
//!
//! ## Request outcomes
//!
//! | Current     | Requested           | Outcome                           |
//! |-------------|---------------------|-----------------------------------|
//! | off/unknown | on                  | budget + min-off check, then pin  |
//! | on          | on, duration > 0    | deadline replaced                 |
//! | on          | on, indefinite      | deadline cleared, or no-op        |
//! | on/unknown  | off                 | pin, completed interval recorded  |
//! | off         | off                 | no-op (`AlreadyInState`)          |
//!
//! Deadlines are serviced by [`Arbitrator::service_deadlines`], called by
//! the runtime on a fixed resolution.  A failed deadline-off keeps its
//! deadline and is retried on the next pass.

use heapless::Deque;
use log::{debug, error, info, warn};

use super::table::{RelaySlot, RelayStateTable};
use super::{AuditRecord, RelayState, RelayTransition, Requester};
use crate::app::ports::PinDriver;
use crate::error::ArbitrationError;
use crate::safety::CurrentBudget;
use crate::snapshot::{RelayActuator, RelayId, SafetyBudget, Switch};

/// Audit records kept before the oldest is overwritten.
pub const AUDIT_DEPTH: usize = 256;

/// A single relay request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRequest {
    pub relay: RelayId,
    pub state: Switch,
    /// Auto-off after this many ms; 0 = indefinite.  Ignored for off.
    pub duration_ms: u64,
    /// Reject an on request if the relay has been off for less than this.
    pub min_off_ms: u64,
    pub requester: Requester,
}

impl RelayRequest {
    pub fn on(relay: RelayId, duration_ms: u64, requester: Requester) -> Self {
        Self {
            relay,
            state: Switch::On,
            duration_ms,
            min_off_ms: 0,
            requester,
        }
    }

    pub fn off(relay: RelayId, requester: Requester) -> Self {
        Self {
            relay,
            state: Switch::Off,
            duration_ms: 0,
            min_off_ms: 0,
            requester,
        }
    }

    pub fn with_min_off(mut self, min_off_ms: u64) -> Self {
        self.min_off_ms = min_off_ms;
        self
    }
}

/// What a successful request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granted {
    /// The physical state changed.
    Switched,
    /// Relay stays on; its auto-off deadline was replaced.
    DeadlineReplaced,
    /// Relay stays on; its pending deadline was dropped (now indefinite).
    DeadlineCleared,
}

pub struct Arbitrator<P: PinDriver> {
    pins: P,
    table: RelayStateTable,
    budget: CurrentBudget,
    audit: Deque<AuditRecord, AUDIT_DEPTH>,
    audit_overwritten: u64,
    transitions: Vec<RelayTransition>,
}

impl<P: PinDriver> Arbitrator<P> {
    pub fn new(pins: P, budget: CurrentBudget) -> Self {
        Self {
            pins,
            table: RelayStateTable::new(),
            budget,
            audit: Deque::new(),
            audit_overwritten: 0,
            transitions: Vec::new(),
        }
    }

    // ── Requests ──────────────────────────────────────────────

    pub fn request(&mut self, req: RelayRequest, now_ms: u64) -> Result<Granted, ArbitrationError> {
        let slot = self
            .table
            .get(req.relay)
            .ok_or(ArbitrationError::UnknownActuator(req.relay))?;

        match (req.state, slot.state) {
            (Switch::On, RelayState::On) => self.extend_on(req, now_ms),
            (Switch::On, _) => self.switch_on(req, now_ms),
            (Switch::Off, RelayState::Off) => Err(ArbitrationError::AlreadyInState(req.relay)),
            (Switch::Off, _) => self.switch_off(req.relay, req.requester, now_ms),
        }
    }

    fn extend_on(&mut self, req: RelayRequest, now_ms: u64) -> Result<Granted, ArbitrationError> {
        let Some(slot) = self.table.get_mut(req.relay) else {
            return Err(ArbitrationError::UnknownActuator(req.relay));
        };
        let granted = if req.duration_ms > 0 {
            slot.deadline_ms = Some(now_ms.saturating_add(req.duration_ms));
            slot.requested_ms = req.duration_ms;
            debug!(
                "Arbitrator: relay {} deadline replaced, off in {} ms ({})",
                req.relay, req.duration_ms, req.requester
            );
            Granted::DeadlineReplaced
        } else if slot.deadline_ms.take().is_some() {
            slot.requested_ms = 0;
            debug!("Arbitrator: relay {} now on indefinitely ({})", req.relay, req.requester);
            Granted::DeadlineCleared
        } else {
            return Err(ArbitrationError::AlreadyInState(req.relay));
        };
        self.record(AuditRecord {
            timestamp_ms: now_ms,
            relay: req.relay,
            state: RelayState::On,
            requested_ms: req.duration_ms,
            completed_on_ms: None,
            requester: req.requester,
        });
        Ok(granted)
    }

    fn switch_on(&mut self, req: RelayRequest, now_ms: u64) -> Result<Granted, ArbitrationError> {
        let load_amps = self.table.load_amps(Some(req.relay));
        let Some(slot) = self.table.get_mut(req.relay) else {
            return Err(ArbitrationError::UnknownActuator(req.relay));
        };

        if req.min_off_ms > 0 && slot.state == RelayState::Off {
            if let Some(off_since) = slot.off_since_ms {
                let off_for = now_ms.saturating_sub(off_since);
                if off_for < req.min_off_ms {
                    return Err(ArbitrationError::MinOffPending {
                        relay: req.relay,
                        remaining_ms: req.min_off_ms - off_for,
                    });
                }
            }
        }

        self.budget.admit(req.relay, load_amps, slot.actuator.amps)?;

        let level = slot.actuator.polarity.level(true);
        if let Err(e) = self.pins.write(slot.actuator.pin, level) {
            error!("Arbitrator: relay {} on failed: {}", req.relay, e);
            slot.state = RelayState::Unknown;
            return Err(e.into());
        }

        slot.state = RelayState::On;
        slot.on_since_ms = Some(now_ms);
        slot.requested_ms = req.duration_ms;
        slot.deadline_ms = (req.duration_ms > 0).then(|| now_ms.saturating_add(req.duration_ms));

        info!(
            "Arbitrator: relay {} ON{} ({})",
            req.relay,
            if req.duration_ms > 0 {
                format!(" for {} ms", req.duration_ms)
            } else {
                String::new()
            },
            req.requester
        );
        self.record(AuditRecord {
            timestamp_ms: now_ms,
            relay: req.relay,
            state: RelayState::On,
            requested_ms: req.duration_ms,
            completed_on_ms: None,
            requester: req.requester,
        });
        self.transitions.push(RelayTransition {
            relay: req.relay,
            state: Switch::On,
            at_ms: now_ms,
            duration_ms: req.duration_ms,
            requester: req.requester,
        });
        Ok(Granted::Switched)
    }

    fn switch_off(
        &mut self,
        relay: RelayId,
        requester: Requester,
        now_ms: u64,
    ) -> Result<Granted, ArbitrationError> {
        let Some(slot) = self.table.get_mut(relay) else {
            return Err(ArbitrationError::UnknownActuator(relay));
        };

        let level = slot.actuator.polarity.level(false);
        if let Err(e) = self.pins.write(slot.actuator.pin, level) {
            // Deadline stays armed so the next service pass retries.
            error!("Arbitrator: relay {} off failed: {}", relay, e);
            slot.state = RelayState::Unknown;
            return Err(e.into());
        }

        let completed = slot
            .on_since_ms
            .take()
            .map_or(0, |since| now_ms.saturating_sub(since));
        slot.state = RelayState::Off;
        slot.off_since_ms = Some(now_ms);
        slot.deadline_ms = None;
        slot.requested_ms = 0;

        info!("Arbitrator: relay {} OFF after {} ms ({})", relay, completed, requester);
        self.record(AuditRecord {
            timestamp_ms: now_ms,
            relay,
            state: RelayState::Off,
            requested_ms: 0,
            completed_on_ms: Some(completed),
            requester,
        });
        self.transitions.push(RelayTransition {
            relay,
            state: Switch::Off,
            at_ms: now_ms,
            duration_ms: completed,
            requester,
        });
        Ok(Granted::Switched)
    }

    // ── Deadlines ─────────────────────────────────────────────

    /// Switch off every relay whose deadline has passed.
    /// Returns the number of relays switched off.
    pub fn service_deadlines(&mut self, now_ms: u64) -> usize {
        let mut switched = 0;
        for relay in self.table.due(now_ms) {
            match self.switch_off(relay, Requester::Deadline, now_ms) {
                Ok(_) => switched += 1,
                Err(e) => warn!("Arbitrator: deadline off for relay {} will retry: {}", relay, e),
            }
        }
        switched
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.table.next_deadline()
    }

    // ── Actuator lifecycle ────────────────────────────────────

    /// Drive every registered actuator off, then switch on the ones
    /// configured to start on (subject to the budget).
    pub fn initialize(&mut self, now_ms: u64) {
        for relay in self.table.ids() {
            self.force_off(relay, now_ms);
        }
        let startup_on: Vec<RelayId> = self
            .table
            .iter()
            .filter(|s| s.actuator.startup.is_on() && s.state == RelayState::Off)
            .map(|s| s.actuator.id)
            .collect();
        for relay in startup_on {
            if let Err(e) = self.request(RelayRequest::on(relay, 0, Requester::Lifecycle), now_ms) {
                warn!("Arbitrator: startup-on relay {} refused: {}", relay, e);
            }
        }
    }

    /// Register a new actuator and drive it off.
    pub fn add_actuator(&mut self, actuator: RelayActuator, now_ms: u64) {
        let id = actuator.id;
        if self.table.contains(id) {
            self.replace_actuator(actuator, now_ms);
            return;
        }
        info!("Arbitrator: registered relay {} on GPIO {}", id, actuator.pin);
        self.table.insert(RelaySlot::new(actuator));
        self.force_off(id, now_ms);
    }

    /// Apply a changed actuator definition.
    ///
    /// A pin or polarity change switches the old line off first and brings
    /// the new line up off.  Other changes (name, amps, startup) apply in
    /// place without touching the pin, except that a drawing actuator whose
    /// amps changed must still fit the budget or is switched off.
    pub fn replace_actuator(&mut self, actuator: RelayActuator, now_ms: u64) {
        let id = actuator.id;
        let Some(slot) = self.table.get_mut(id) else {
            self.add_actuator(actuator, now_ms);
            return;
        };
        let rewired =
            slot.actuator.pin != actuator.pin || slot.actuator.polarity != actuator.polarity;
        if !rewired {
            let amps = actuator.amps;
            let recheck = slot.state != RelayState::Off && slot.actuator.amps != amps;
            slot.actuator = actuator;
            if recheck {
                self.recheck_budget(id, amps, now_ms);
            }
            return;
        }
        if slot.state != RelayState::Off {
            if let Err(e) = self.switch_off(id, Requester::Lifecycle, now_ms) {
                warn!("Arbitrator: relay {} old pin off failed: {}", id, e);
            }
        }
        let Some(slot) = self.table.get_mut(id) else {
            return;
        };
        let old_pin = slot.actuator.pin;
        info!("Arbitrator: relay {} rewired GPIO {} -> {}", id, old_pin, actuator.pin);
        slot.actuator = actuator;
        slot.state = RelayState::Unknown;
        if old_pin != slot.actuator.pin {
            self.pins.release(old_pin);
        }
        self.force_off(id, now_ms);
    }

    fn recheck_budget(&mut self, id: RelayId, amps: f32, now_ms: u64) {
        let load_amps = self.table.load_amps(Some(id));
        if let Err(e) = self.budget.admit(id, load_amps, amps) {
            warn!("Arbitrator: relay {} no longer fits after reload, switching off: {}", id, e);
            if let Err(e) = self.switch_off(id, Requester::Lifecycle, now_ms) {
                warn!("Arbitrator: relay {} off failed: {}", id, e);
            }
        }
    }

    /// Switch an actuator off and forget it.
    pub fn remove_actuator(&mut self, relay: RelayId, now_ms: u64) {
        let Some(slot) = self.table.get(relay) else {
            return;
        };
        if slot.state != RelayState::Off {
            if let Err(e) = self.switch_off(relay, Requester::Lifecycle, now_ms) {
                warn!("Arbitrator: relay {} off before removal failed: {}", relay, e);
            }
        }
        if let Some(slot) = self.table.remove(relay) {
            self.pins.release(slot.actuator.pin);
            info!("Arbitrator: removed relay {}", relay);
        }
    }

    /// Switch everything off (shutdown).  Unknown relays are written too.
    pub fn all_off(&mut self, requester: Requester, now_ms: u64) {
        for relay in self.table.ids() {
            if self.table.state(relay) != Some(RelayState::Off) {
                if let Err(e) = self.switch_off(relay, requester, now_ms) {
                    error!("Arbitrator: relay {} failed to switch off: {}", relay, e);
                }
            }
        }
    }

    /// Write the off level without emitting a transition (initialisation).
    fn force_off(&mut self, relay: RelayId, now_ms: u64) {
        let Some(slot) = self.table.get_mut(relay) else {
            return;
        };
        let was = slot.state;
        match self.pins.write(slot.actuator.pin, slot.actuator.polarity.level(false)) {
            Ok(()) => {
                slot.state = RelayState::Off;
                slot.deadline_ms = None;
                slot.on_since_ms = None;
                slot.requested_ms = 0;
                if was != RelayState::Off {
                    self.record(AuditRecord {
                        timestamp_ms: now_ms,
                        relay,
                        state: RelayState::Off,
                        requested_ms: 0,
                        completed_on_ms: None,
                        requester: Requester::Lifecycle,
                    });
                }
            }
            Err(e) => {
                error!("Arbitrator: relay {} initial off failed: {}", relay, e);
                slot.state = RelayState::Unknown;
            }
        }
    }

    // ── Budget ────────────────────────────────────────────────

    pub fn set_budget(&mut self, config: SafetyBudget) {
        self.budget.update(config);
    }

    pub fn budget(&self) -> &CurrentBudget {
        &self.budget
    }

    /// Current draw of everything on or unknown.
    pub fn load_amps(&self) -> f32 {
        self.table.load_amps(None)
    }

    // ── Queries / drains ──────────────────────────────────────

    pub fn state(&self, relay: RelayId) -> Option<RelayState> {
        self.table.state(relay)
    }

    pub fn table(&self) -> &RelayStateTable {
        &self.table
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    /// Transitions since the last drain, in the order they happened.
    pub fn drain_transitions(&mut self) -> Vec<RelayTransition> {
        std::mem::take(&mut self.transitions)
    }

    /// Audit records since the last drain, oldest first.
    pub fn drain_audit(&mut self) -> Vec<AuditRecord> {
        let mut out = Vec::with_capacity(self.audit.len());
        while let Some(rec) = self.audit.pop_front() {
            out.push(rec);
        }
        out
    }

    /// Records dropped because nobody drained the ring in time.
    pub fn audit_overwritten(&self) -> u64 {
        self.audit_overwritten
    }

    fn record(&mut self, rec: AuditRecord) {
        if self.audit.is_full() {
            self.audit.pop_front();
            self.audit_overwritten += 1;
        }
        let _ = self.audit.push_back(rec);
    }
}

//! Duty-cycle timers.
//!
//! Free-running oscillators that drive one relay each, independent of
//! sensor data.  The runtime polls every timer at the wake time the timer
//! last returned.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                                                              │
//! │   Idle ──▶ On(on_secs) ──▶ Off(off_secs) ──┐                 │
//! │    │           ▲                           │                 │
//! │    │           └───────────────────────────┘                 │
//! │    │                                                         │
//! │    └─ off_secs == 0 ──▶ Latched (on, indefinitely)           │
//! │                                                              │
//! │   stop() from any phase ──▶ relay off, Stopped               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The on request carries `on_secs` as its duration, so the arbitrator's
//! auto-off deadline ends the on phase even if the timer task is late.

use log::{info, warn};

use crate::app::ports::PinDriver;
use crate::relay::{Arbitrator, RelayRequest, Requester};
use crate::snapshot::{RelayId, TimerConfig, TimerId};

// ═══════════════════════════════════════════════════════════════
//  Phases
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Running, about to start an on phase.
    Idle,
    On { until_ms: u64 },
    Off { until_ms: u64 },
    /// `off_secs == 0`: switched on for good, oscillation over.
    Latched,
    Stopped,
}

// ═══════════════════════════════════════════════════════════════
//  Timer
// ═══════════════════════════════════════════════════════════════

pub struct DutyTimer {
    config: TimerConfig,
    phase: Phase,
    cycles: u64,
}

impl DutyTimer {
    pub fn new(config: TimerConfig) -> Self {
        let phase = if config.running {
            Phase::Idle
        } else {
            Phase::Stopped
        };
        Self {
            config,
            phase,
            cycles: 0,
        }
    }

    pub fn id(&self) -> TimerId {
        self.config.id
    }

    pub fn relay(&self) -> RelayId {
        self.config.relay
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase, Phase::Stopped)
    }

    fn on_ms(&self) -> u64 {
        u64::from(self.config.on_secs) * 1000
    }

    fn off_ms(&self) -> u64 {
        u64::from(self.config.off_secs) * 1000
    }

    /// Advance the oscillator.  Returns the next time it needs polling,
    /// or `None` when it is latched or stopped.
    pub fn poll<P: PinDriver>(&mut self, arb: &mut Arbitrator<P>, now_ms: u64) -> Option<u64> {
        match self.phase {
            Phase::Idle => self.begin_on(arb, now_ms),
            Phase::On { until_ms } if now_ms >= until_ms => {
                self.request_off(arb, now_ms);
                let until_ms = now_ms + self.off_ms();
                self.phase = Phase::Off { until_ms };
                Some(until_ms)
            }
            Phase::Off { until_ms } if now_ms >= until_ms => self.begin_on(arb, now_ms),
            Phase::On { until_ms } | Phase::Off { until_ms } => Some(until_ms),
            Phase::Latched | Phase::Stopped => None,
        }
    }

    fn begin_on<P: PinDriver>(&mut self, arb: &mut Arbitrator<P>, now_ms: u64) -> Option<u64> {
        let id = self.config.id;
        if self.config.off_secs == 0 {
            let req = RelayRequest::on(self.config.relay, 0, Requester::Timer(id));
            return match arb.request(req, now_ms) {
                Ok(_) => {
                    info!("Timer {}: relay {} latched on", id, self.config.relay);
                    self.phase = Phase::Latched;
                    None
                }
                Err(e) if e.is_noop() => {
                    self.phase = Phase::Latched;
                    None
                }
                Err(e) => {
                    warn!("Timer {}: latch on refused, retrying: {}", id, e);
                    Some(now_ms + self.on_ms())
                }
            };
        }

        let req = RelayRequest::on(self.config.relay, self.on_ms(), Requester::Timer(id));
        if let Err(e) = arb.request(req, now_ms) {
            warn!("Timer {}: on phase for relay {} refused: {}", id, self.config.relay, e);
        }
        self.cycles += 1;
        let until_ms = now_ms + self.on_ms();
        self.phase = Phase::On { until_ms };
        Some(until_ms)
    }

    fn request_off<P: PinDriver>(&self, arb: &mut Arbitrator<P>, now_ms: u64) {
        let req = RelayRequest::off(self.config.relay, Requester::Timer(self.config.id));
        match arb.request(req, now_ms) {
            Ok(_) => {}
            Err(e) if e.is_noop() => {}
            Err(e) => warn!("Timer {}: off for relay {} failed: {}", self.config.id, self.config.relay, e),
        }
    }

    /// Stop oscillating and switch the relay off now.
    pub fn stop<P: PinDriver>(&mut self, arb: &mut Arbitrator<P>, now_ms: u64) {
        if self.phase != Phase::Stopped {
            info!("Timer {}: stopped", self.config.id);
        }
        self.request_off(arb, now_ms);
        self.phase = Phase::Stopped;
        self.config.running = false;
    }

    /// Resume from the beginning of an on phase.
    pub fn start(&mut self) {
        if self.phase == Phase::Stopped {
            info!("Timer {}: started", self.config.id);
            self.phase = Phase::Idle;
        }
        self.config.running = true;
    }
}

//! PID control loops.
//!
//! One [`PidLoop`] per configured controller.  The runtime calls
//! [`PidLoop::run_cycle`] once per sample period; everything the loop does
//! to the outside world goes through the arbitrator as a bounded on request.
//!
//! ```text
//!   Disabled ──enable, no reading──▶ AwaitingFirstReading ──reading──▶ Regulating
//!      │ ▲                                                              ▲   │
//!      │ └──────────────────────────── disable ─────────────────────────┼───┘
//!      └───────────────────────── enable, reading cached ───────────────┘
//! ```
//!
//! A Regulating loop never falls back to AwaitingFirstReading: stale or
//! missing readings skip the cycle and leave the state alone.

use log::{debug, info, warn};

use super::pid::PidController;
use crate::app::ports::PinDriver;
use crate::cache::ReadingCache;
use crate::error::{ArbitrationError, StaleReading};
use crate::relay::{Arbitrator, RelayRequest, RelayState, Requester};
use crate::snapshot::{secs_to_ms, Direction, OutputBounds, PidConfig, PidId, RelayId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Disabled,
    AwaitingFirstReading,
    Regulating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Up,
    Down,
}

/// What one sample period did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    Disabled,
    AwaitingFirstReading,
    /// The zone is deactivated.
    ZoneInactive,
    /// The reading vanished from the cache after regulation started.
    NoReading,
    /// Reading older than the controller's maximum measurement age.
    Stale(StaleReading),
    /// Measurement inside the hysteresis band.
    InsideBand,
    /// Output zero, or pointing at a side the direction excludes.
    NoDemand { output: f32 },
    /// Demand too small to reach the side's minimum on-time.
    BelowMinimum { side: Side, output: f32 },
    Actuated {
        side: Side,
        relay: RelayId,
        duration_ms: u64,
        output: f32,
    },
    Rejected {
        side: Side,
        relay: RelayId,
        error: ArbitrationError,
    },
}

pub struct PidLoop {
    config: PidConfig,
    controller: PidController,
    state: LoopState,
    last_side: Option<Side>,
    /// Advisory staleness threshold (zone period × stale factor).
    stale_after_ms: Option<u64>,
}

impl PidLoop {
    pub fn new(config: PidConfig, zone_period_ms: Option<u64>, stale_factor: u32) -> Self {
        let state = if config.enabled {
            LoopState::AwaitingFirstReading
        } else {
            LoopState::Disabled
        };
        Self {
            controller: PidController::from_config(&config),
            stale_after_ms: zone_period_ms.map(|p| p.saturating_mul(u64::from(stale_factor.max(1)))),
            config,
            state,
            last_side: None,
        }
    }

    pub fn id(&self) -> PidId {
        self.config.id
    }

    pub fn config(&self) -> &PidConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn period_ms(&self) -> u64 {
        secs_to_ms(self.config.period_secs).max(1)
    }

    pub fn controller(&self) -> &PidController {
        &self.controller
    }

    /// Override toggle.  Enabling clears the integral and derivative memory
    /// and resumes regulation at once when a reading is already cached;
    /// disabling does not recall durations already granted.
    pub fn set_enabled(&mut self, enabled: bool, cache: &ReadingCache) {
        match (enabled, self.state) {
            (true, LoopState::Disabled) => {
                self.controller.reset();
                self.last_side = None;
                self.state = if cache.latest(self.config.zone, self.config.variable).is_some() {
                    LoopState::Regulating
                } else {
                    LoopState::AwaitingFirstReading
                };
                info!("PID {}: enabled ({:?})", self.config.id, self.state);
            }
            (false, LoopState::AwaitingFirstReading | LoopState::Regulating) => {
                self.state = LoopState::Disabled;
                info!("PID {}: override active", self.config.id);
            }
            _ => {}
        }
        self.config.enabled = enabled;
    }

    /// Relays this loop may drive: the sides its direction allows.
    pub fn owned_relays(&self) -> Vec<RelayId> {
        self.config.relays().collect()
    }

    /// Switch every owned relay off (teardown on reload or removal).  A side
    /// the direction excludes is left alone even when configured.
    pub fn release<P: PinDriver>(&self, arb: &mut Arbitrator<P>, now_ms: u64) {
        for relay in self.owned_relays() {
            match arb.request(RelayRequest::off(relay, Requester::Pid(self.config.id)), now_ms) {
                Ok(_) => {}
                Err(e) if e.is_noop() => {}
                Err(e) => warn!("PID {}: final off for relay {} failed: {}", self.config.id, relay, e),
            }
        }
    }

    /// One sample period.
    pub fn run_cycle<P: PinDriver>(
        &mut self,
        cache: &ReadingCache,
        arb: &mut Arbitrator<P>,
        now_ms: u64,
    ) -> CycleOutcome {
        let id = self.config.id;
        if self.state == LoopState::Disabled {
            return CycleOutcome::Disabled;
        }

        let max_age_ms = self.config.max_measure_age_secs.map_or(u64::MAX, secs_to_ms);
        let (zone, variable) = (self.config.zone, self.config.variable);
        let reading = match cache.fresh(zone, variable, max_age_ms, now_ms) {
            None if self.state == LoopState::AwaitingFirstReading => {
                debug!("PID {}: awaiting first reading", id);
                return CycleOutcome::AwaitingFirstReading;
            }
            None => {
                warn!("PID {}: skipping cycle, reading no longer cached", id);
                return CycleOutcome::NoReading;
            }
            Some(fresh) => {
                self.state = LoopState::Regulating;
                match fresh {
                    Ok(reading) => reading,
                    Err(stale) => {
                        warn!("PID {}: skipping cycle, {}", id, stale);
                        return CycleOutcome::Stale(stale);
                    }
                }
            }
        };

        let age_ms = reading.age_ms(now_ms);
        if self.stale_after_ms.is_some_and(|limit| age_ms > limit) {
            warn!(
                "PID {}: zone {} {} reading is {} ms old",
                id, self.config.zone, self.config.variable, age_ms
            );
        }

        let Some(output) = self.controller.compute(reading.value, self.config.period_secs) else {
            return CycleOutcome::InsideBand;
        };

        let side = match self.config.direction {
            Direction::Up if output > 0.0 => Side::Up,
            Direction::Down if output < 0.0 => Side::Down,
            Direction::Both if output > 0.0 => Side::Up,
            Direction::Both if output < 0.0 => Side::Down,
            _ => return CycleOutcome::NoDemand { output },
        };
        let bounds = match side {
            Side::Up => self.config.up,
            Side::Down => self.config.down,
        };
        let Some(bounds) = bounds else {
            return CycleOutcome::NoDemand { output };
        };

        if self.config.direction == Direction::Both && self.last_side != Some(side) {
            self.stop_opposite(side, arb, now_ms);
        }
        self.last_side = Some(side);

        let Some(duration_ms) = actuation_ms(output, self.config.output_scale, &bounds) else {
            debug!("PID {}: output {:.3} below minimum on-time", id, output);
            return CycleOutcome::BelowMinimum { side, output };
        };

        let req = RelayRequest::on(bounds.relay, duration_ms, Requester::Pid(id))
            .with_min_off(secs_to_ms(bounds.min_off_secs));
        match arb.request(req, now_ms) {
            Ok(_) => CycleOutcome::Actuated {
                side,
                relay: bounds.relay,
                duration_ms,
                output,
            },
            Err(error) => {
                warn!("PID {}: relay {} request rejected: {}", id, bounds.relay, error);
                CycleOutcome::Rejected {
                    side,
                    relay: bounds.relay,
                    error,
                }
            }
        }
    }

    fn stop_opposite<P: PinDriver>(&self, side: Side, arb: &mut Arbitrator<P>, now_ms: u64) {
        let opposite = match side {
            Side::Up => self.config.down,
            Side::Down => self.config.up,
        };
        let Some(opposite) = opposite else {
            return;
        };
        if arb.state(opposite.relay) == Some(RelayState::On) {
            let req = RelayRequest::off(opposite.relay, Requester::Pid(self.config.id));
            if let Err(e) = arb.request(req, now_ms) {
                warn!("PID {}: could not stop relay {}: {}", self.config.id, opposite.relay, e);
            }
        }
    }
}

/// On-time for a controller output: `|output| × scale` seconds, capped at
/// the side's maximum.  Anything under the minimum yields no actuation.
pub fn actuation_ms(output: f32, scale: f32, bounds: &OutputBounds) -> Option<u64> {
    let wanted_ms = secs_to_ms(output.abs() * scale);
    let max_ms = secs_to_ms(bounds.max_secs);
    let min_ms = secs_to_ms(bounds.min_secs);
    let duration_ms = wanted_ms.min(max_ms);
    (duration_ms > 0 && duration_ms >= min_ms).then_some(duration_ms)
}

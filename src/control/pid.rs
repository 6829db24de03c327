//! PID controller for environment regulation.
//!
//! Proportional-integral-derivative controller with a clamped integrator,
//! derivative seeding on the first sample after a reset, and an optional
//! hysteresis band around the setpoint.
//!
//! ## Hysteresis band
//!
//! With `band > 0` the controller only regulates outside
//! `[setpoint - band, setpoint + band]`:
//!
//! - **Up**: below the band it latches on and drives toward the *upper*
//!   edge; it keeps regulating inside the band until the upper edge is
//!   crossed, then idles.
//! - **Down**: mirror image, driving toward the lower edge.
//! - **Both**: below the band drives toward the lower edge, above it
//!   toward the upper edge, idles inside.  Switching side clears the
//!   integral and derivative memory.

use crate::snapshot::{Direction, PidConfig};

/// Which side the band logic last latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BandLatch {
    None,
    Raising,
    Lowering,
}

/// PID controller
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f32,
    ki: f32,
    kd: f32,
    setpoint: f32,
    direction: Direction,
    band: f32,
    integral: f32,
    integral_min: f32,
    integral_max: f32,
    /// `None` until the first sample after a reset.
    prev_error: Option<f32>,
    latch: BandLatch,
}

impl PidController {
    pub fn new(kp: f32, ki: f32, kd: f32, setpoint: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint,
            direction: Direction::Both,
            band: 0.0,
            integral: 0.0,
            integral_min: -500.0,
            integral_max: 500.0,
            prev_error: None,
            latch: BandLatch::None,
        }
    }

    pub fn from_config(cfg: &PidConfig) -> Self {
        let mut pid = Self::new(cfg.kp, cfg.ki, cfg.kd, cfg.setpoint);
        pid.direction = cfg.direction;
        pid.band = cfg.band;
        pid.set_integral_limits(cfg.integrator_min, cfg.integrator_max);
        pid
    }

    /// Clamp range for the accumulated integral.
    pub fn set_integral_limits(&mut self, min: f32, max: f32) {
        self.integral_min = min;
        self.integral_max = max;
        self.integral = self.integral.clamp(min, max);
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// Setpoint the next `compute` would regulate toward, or `None` when the
    /// measurement sits inside the hysteresis band.  Updates the band latch.
    fn effective_setpoint(&mut self, measurement: f32) -> Option<f32> {
        if self.band <= 0.0 {
            return Some(self.setpoint);
        }
        let lower = self.setpoint - self.band;
        let upper = self.setpoint + self.band;

        match self.direction {
            Direction::Up => {
                if measurement < lower || (measurement < upper && self.latch == BandLatch::Raising)
                {
                    self.latch = BandLatch::Raising;
                    Some(upper)
                } else {
                    if measurement >= upper {
                        self.latch = BandLatch::None;
                    }
                    None
                }
            }
            Direction::Down => {
                if measurement > upper
                    || (measurement > lower && self.latch == BandLatch::Lowering)
                {
                    self.latch = BandLatch::Lowering;
                    Some(lower)
                } else {
                    if measurement <= lower {
                        self.latch = BandLatch::None;
                    }
                    None
                }
            }
            Direction::Both => {
                if measurement < lower {
                    if self.latch != BandLatch::Raising {
                        self.clear_memory();
                        self.latch = BandLatch::Raising;
                    }
                    Some(lower)
                } else if measurement > upper {
                    if self.latch != BandLatch::Lowering {
                        self.clear_memory();
                        self.latch = BandLatch::Lowering;
                    }
                    Some(upper)
                } else {
                    None
                }
            }
        }
    }

    /// Compute PID output given current measurement.
    ///
    /// Returns `None` when the hysteresis band restricts regulation; the
    /// controller memory is left untouched in that case.
    pub fn compute(&mut self, measurement: f32, dt: f32) -> Option<f32> {
        let setpoint = self.effective_setpoint(measurement)?;
        let error = setpoint - measurement;

        // Proportional
        let p = self.kp * error;

        // Integral (clamped)
        self.integral = (self.integral + error * dt).clamp(self.integral_min, self.integral_max);
        let i = self.ki * self.integral;

        // Derivative, seeded on the first sample so there is no kick
        let prev = self.prev_error.unwrap_or(error);
        let derivative = if dt > 0.0 { (error - prev) / dt } else { 0.0 };
        let d = self.kd * derivative;

        self.prev_error = Some(error);

        log::debug!(
            "PID: in={:.2} sp={:.2} P={:.3} I={:.3} D={:.3}",
            measurement,
            setpoint,
            p,
            i,
            d
        );
        Some(p + i + d)
    }

    /// Reset controller state
    pub fn reset(&mut self) {
        self.clear_memory();
        self.latch = BandLatch::None;
    }

    fn clear_memory(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }
}

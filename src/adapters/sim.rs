//! Simulated pins.
//!
//! Keeps the last level written to each pin and logs every write.  Used
//! with `pin_backend = "simulated"` on hosts without GPIO.

use std::collections::BTreeMap;

use log::info;

use crate::app::ports::PinDriver;
use crate::error::PinError;

#[derive(Debug, Default, Clone)]
pub struct SimulatedPins {
    levels: BTreeMap<u8, bool>,
    writes: u64,
}

impl SimulatedPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written level, `None` if never written or released.
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels.get(&pin).copied()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl PinDriver for SimulatedPins {
    fn write(&mut self, pin: u8, level: bool) -> Result<(), PinError> {
        info!("SIM | pin {} -> {}", pin, if level { "HIGH" } else { "LOW" });
        self.levels.insert(pin, level);
        self.writes += 1;
        Ok(())
    }

    fn release(&mut self, pin: u8) {
        self.levels.remove(&pin);
    }
}

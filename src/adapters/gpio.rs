//! GPIO pin drivers.
//!
//! - [`SysfsPins`] drives Linux sysfs GPIO lines (`export`, `direction`,
//!   `value`).  Pins are exported lazily on first write and unexported on
//!   release.
//! - [`HalPins`] wraps any set of `embedded-hal` [`OutputPin`]s, keyed by
//!   pin number, for boards with a HAL crate.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use embedded_hal::digital::OutputPin;
use log::{debug, warn};

use crate::app::ports::PinDriver;
use crate::error::{PinError, PinErrorKind};

// ── Sysfs ─────────────────────────────────────────────────────

pub struct SysfsPins {
    root: PathBuf,
    exported: BTreeSet<u8>,
}

impl SysfsPins {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exported: BTreeSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn export(&mut self, pin: u8) -> Result<(), PinError> {
        if self.exported.contains(&pin) {
            return Ok(());
        }
        let dir = self.pin_dir(pin);
        if !dir.exists() {
            fs::write(self.root.join("export"), pin.to_string()).map_err(|e| {
                warn!("GPIO: export {} failed: {}", pin, e);
                PinError {
                    pin,
                    kind: PinErrorKind::Unavailable,
                }
            })?;
        }
        fs::write(dir.join("direction"), "out").map_err(|e| {
            warn!("GPIO: direction {} failed: {}", pin, e);
            PinError {
                pin,
                kind: PinErrorKind::Unavailable,
            }
        })?;
        debug!("GPIO: exported pin {}", pin);
        self.exported.insert(pin);
        Ok(())
    }
}

impl PinDriver for SysfsPins {
    fn write(&mut self, pin: u8, level: bool) -> Result<(), PinError> {
        self.export(pin)?;
        let value = if level { "1" } else { "0" };
        fs::write(self.pin_dir(pin).join("value"), value).map_err(|e| {
            warn!("GPIO: write {}={} failed: {}", pin, value, e);
            PinError {
                pin,
                kind: PinErrorKind::WriteFailed,
            }
        })
    }

    fn release(&mut self, pin: u8) {
        if !self.exported.remove(&pin) {
            return;
        }
        if let Err(e) = fs::write(self.root.join("unexport"), pin.to_string()) {
            warn!("GPIO: unexport {} failed: {}", pin, e);
        }
    }
}

// ── embedded-hal ──────────────────────────────────────────────

pub struct HalPins<P: OutputPin> {
    pins: BTreeMap<u8, P>,
}

impl<P: OutputPin> Default for HalPins<P> {
    fn default() -> Self {
        Self {
            pins: BTreeMap::new(),
        }
    }
}

impl<P: OutputPin> HalPins<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pin` under `number`, replacing any previous one.
    pub fn with_pin(mut self, number: u8, pin: P) -> Self {
        self.pins.insert(number, pin);
        self
    }

    pub fn get(&self, number: u8) -> Option<&P> {
        self.pins.get(&number)
    }
}

impl<P: OutputPin> PinDriver for HalPins<P> {
    fn write(&mut self, pin: u8, level: bool) -> Result<(), PinError> {
        let out = self.pins.get_mut(&pin).ok_or(PinError {
            pin,
            kind: PinErrorKind::Unavailable,
        })?;
        let result = if level { out.set_high() } else { out.set_low() };
        result.map_err(|_| PinError {
            pin,
            kind: PinErrorKind::WriteFailed,
        })
    }
}

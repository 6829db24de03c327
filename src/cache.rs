//! Reading cache: latest value per (zone, variable).
//!
//! Written by the acquisition side (control socket thread or an in-process
//! sampler), read by PID loops and threshold rules on the control thread.
//! Clones share the same storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::StaleReading;
use crate::snapshot::{Variable, ZoneId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f32,
    /// Monotonic milliseconds at which the sample was taken.
    pub timestamp_ms: u64,
}

impl Reading {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadingCache {
    inner: Arc<RwLock<HashMap<(ZoneId, Variable), Reading>>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a sample.  An older timestamp never overwrites a newer one.
    pub fn push(&self, zone: ZoneId, variable: Variable, value: f32, timestamp_ms: u64) {
        if !value.is_finite() {
            log::warn!("Cache: dropping non-finite {} sample for zone {}", variable, zone);
            return;
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = map.entry((zone, variable)).or_insert(Reading {
            value,
            timestamp_ms,
        });
        if timestamp_ms >= slot.timestamp_ms {
            *slot = Reading {
                value,
                timestamp_ms,
            };
        }
    }

    /// Latest reading, or `None` if the pair was never sampled.
    pub fn latest(&self, zone: ZoneId, variable: Variable) -> Option<Reading> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(zone, variable))
            .copied()
    }

    /// Latest reading, rejected when older than `max_age_ms`.
    pub fn fresh(
        &self,
        zone: ZoneId,
        variable: Variable,
        max_age_ms: u64,
        now_ms: u64,
    ) -> Option<Result<Reading, StaleReading>> {
        let reading = self.latest(zone, variable)?;
        let age_ms = reading.age_ms(now_ms);
        Some(if age_ms > max_age_ms {
            Err(StaleReading {
                zone,
                variable,
                age_ms,
                max_age_ms,
            })
        } else {
            Ok(reading)
        })
    }

    /// Forget every reading of a zone (zone removed on reload).
    pub fn forget_zone(&self, zone: ZoneId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(z, _), _| *z != zone);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

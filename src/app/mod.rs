//! Application core — domain orchestration, zero I/O.
//!
//! This module ties the greenhouse control pieces together: relay
//! arbitration, PID loops, conditional rules and duty-cycle timers.
//! All interaction with hardware and the host happens through **port
//! traits** defined in [`ports`], keeping this layer fully testable
//! without real relays.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;

//! Closed-loop regulation: the PID law and the per-controller loops.

pub mod manager;
pub mod pid;

pub use manager::{CycleOutcome, LoopState, PidLoop, Side};
pub use pid::PidController;

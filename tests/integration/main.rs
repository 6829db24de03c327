//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that exercises one subsystem of the
//! control core against mock adapters.  All tests run on the host with no
//! GPIO, shell or mail transport required.

mod arbitrator_tests;
mod reload_tests;
mod rule_tests;
mod runtime_tests;
mod scheduler_tests;

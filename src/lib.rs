//! growctl — greenhouse relay control core.
//!
//! Exposes the control modules for the `growctld` daemon, integration
//! testing and external tooling.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod cache;
pub mod config;
pub mod control;
pub mod error;
pub mod relay;
pub mod rules;
pub mod runtime;
pub mod safety;
pub mod scheduler;
pub mod snapshot;

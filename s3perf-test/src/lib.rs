//! Test utilities for the benchmark and scanner tools.
//!
//! See the modules for all available utilities.

pub mod fixtures;
pub mod tracing;

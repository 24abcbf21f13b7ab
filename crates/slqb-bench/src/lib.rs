//! Shared fixtures for the SLQB benchmarks.

#![forbid(unsafe_code)]

use std::sync::Arc;

use slqb_core::{SimulatedPageSource, Slqb, SlqbConfig, SlqbError};

/// Allocator over an unbounded single-node page source with statistics
/// switched off, so the measured paths carry no counter traffic.
pub fn bench_allocator() -> Result<Slqb, SlqbError> {
    let config = SlqbConfig {
        stats_enabled: false,
        ..SlqbConfig::default()
    };
    Slqb::new(config, Arc::new(SimulatedPageSource::unbounded()))
}

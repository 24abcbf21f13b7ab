//! Stress and inspection tooling for the SLQB allocator.
//!
//! This crate provides:
//! - Allocation storms: multi-threaded kmalloc/kfree workloads with a
//!   shared live set that catches duplicate hand-outs
//! - Reports: machine-readable summaries of allocator statistics and
//!   per-cache slabinfo after a run

#![forbid(unsafe_code)]

pub mod storm;

pub use storm::{StormConfig, StormError, StormReport, StormType, run_storm};

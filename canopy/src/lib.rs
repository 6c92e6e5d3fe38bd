//! Synthetic search-style workload wired through the fanout runtime, plus
//! the shared CLI plumbing for the three node binaries.

pub mod cli;
pub mod workload;

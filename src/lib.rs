//! Interactive startup benchmarks for versioned CLI binaries.
//!
//! A trial spawns one version in a pseudo-terminal and watches its output
//! until the interactive UI is ready, a version-gate error is printed, the
//! process exits, or a timeout passes. Trials are repeated per version and
//! folded into summary statistics.

pub mod aggregate;
pub mod config;
pub mod detector;
pub mod log;
pub mod prompt;
pub mod report;
pub mod result;
pub mod signals;
pub mod spawn_timing;
pub mod supervisor;
pub mod target;

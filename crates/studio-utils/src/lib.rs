//! Shared utilities for the studio daemon.

#![warn(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Port discovery utilities.
pub mod discovery;
/// Environment variable utilities.
pub mod env;
/// Filesystem utilities.
pub mod fs;
/// Probe utilities.
pub mod probe;
/// Process management utilities.
pub mod process;

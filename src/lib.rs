//! prompt-pulse: a background agent that keeps fresh snapshots of usage,
//! billing, and system signals for shell prompts and dashboards.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// Collector framework and the concrete collectors.
pub mod collectors;
/// Application configuration loading.
pub mod config;
/// Daemon lifecycle: PID lock, health publication, IPC, orchestration.
pub mod daemon;
/// Failure classification for upstream probes.
pub mod errors;
/// Persistent snapshot and banner storage.
pub mod store;
/// HTTP retry middleware.
pub mod transport;
/// Shared utilities (paths, atomic writes, log hygiene).
pub mod utils;

//! Shared utilities (paths, atomic file writes, log hygiene).

/// Atomic temp-then-rename file writes.
pub mod fs;
/// Old log file removal.
pub mod log_cleanup;
/// Path resolution for the cache, runtime, and config directories.
pub mod paths;

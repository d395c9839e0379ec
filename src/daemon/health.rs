//! Daemon health publication.
//!
//! The daemon periodically writes a JSON document describing itself and
//! every collector. External readers (the `health` subcommand, shell
//! integrations) only ever see this file — they never query live state.
//! A file older than the staleness threshold means the daemon is dead
//! even if the bytes parse fine.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::fs::write_atomic;

/// A health file older than this is treated as "daemon dead".
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Errors from health file operations.
#[derive(Debug, Error)]
pub enum HealthFileError {
    /// The health file does not exist — the daemon never ran here.
    #[error("health file not found at {path}")]
    NotFound {
        /// The path that was probed.
        path: String,
    },

    /// Filesystem failure.
    #[error("health file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but does not hold a health document.
    #[error("health file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Per-collector liveness record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorStatus {
    /// Collector name (equals its cache key).
    pub name: String,
    /// False after the most recent run errored.
    pub healthy: bool,
    /// Wall-clock start of the most recent run.
    pub last_run: Option<DateTime<Utc>>,
    /// Duration of the most recent run in milliseconds.
    pub last_latency_ms: u64,
    /// Total completed runs.
    pub run_count: u64,
    /// Total failed runs.
    pub error_count: u64,
    /// Message of the most recent failure, cleared on success.
    pub last_error: Option<String>,
}

impl CollectorStatus {
    /// A fresh status for a collector that has not run yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            last_run: None,
            last_latency_ms: 0,
            run_count: 0,
            error_count: 0,
            last_error: None,
        }
    }
}

/// The daemon-wide record written to the health file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Daemon process ID.
    pub pid: u32,
    /// When the daemon started.
    pub started_at: DateTime<Utc>,
    /// Nanoseconds since `started_at` at publish time.
    pub uptime_ns: u64,
    /// When this document was published.
    pub last_update: DateTime<Utc>,
    /// Per-collector status, keyed by collector name.
    pub collectors: BTreeMap<String, CollectorStatus>,
}

impl HealthStatus {
    /// True when the document was published longer than `threshold` ago.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_update);
        age.to_std().is_ok_and(|age| age > threshold)
    }
}

/// Atomically publish `status` to `path` as indented JSON.
///
/// # Errors
///
/// Returns an error if serialization or the atomic write fails.
pub fn write(path: &Path, status: &HealthStatus) -> Result<(), HealthFileError> {
    let bytes = serde_json::to_vec_pretty(status)?;
    write_atomic(path, &bytes, 0o644)?;
    Ok(())
}

/// Read the health document at `path`.
///
/// # Errors
///
/// Returns [`HealthFileError::NotFound`] when the file is absent, so
/// callers can distinguish "daemon never ran" from "daemon stopped
/// publishing" (the latter shows up as a stale but readable document).
pub fn read(path: &Path) -> Result<HealthStatus, HealthFileError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HealthFileError::NotFound {
                path: path.display().to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

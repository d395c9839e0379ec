//! Collector framework: the trait every data source implements and the
//! runtime that schedules them.
//!
//! A collector produces periodic snapshots of one data source. The
//! runtime ticks each collector on its own cadence, isolates failures,
//! and fans results into one update stream; a single consumer persists
//! them. Collectors know nothing about each other or about storage.

/// Claude subscription quota and API rate-limit collector.
pub mod claude;
/// Per-collector tickers, panic isolation, and the update channel.
pub mod runtime;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// One snapshot emitted by a collector run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CollectResult {
    /// Collector name; doubles as the cache key.
    pub collector: String,
    /// Wall-clock at the start of the run.
    pub timestamp: DateTime<Utc>,
    /// The snapshot payload. Opaque to everything but the owning collector.
    pub data: serde_json::Value,
    /// Per-subunit failures that did not abort the run, in occurrence order.
    pub warnings: Vec<String>,
}

/// A unit producing periodic snapshots of one data source.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable name; equals the cache key the snapshot is stored under.
    fn name(&self) -> &'static str;

    /// One-line human description for health output.
    fn description(&self) -> &'static str;

    /// How often the runtime should invoke [`Collector::collect`].
    fn interval(&self) -> Duration;

    /// Produce one snapshot.
    ///
    /// Per-subunit failures must be folded into the result's warnings;
    /// only cancellation (or a wholesale failure) should surface as `Err`.
    async fn collect(&self, cancel: CancellationToken) -> anyhow::Result<CollectResult>;
}

//! Keyed store of pre-rendered banner strings.
//!
//! Rendering a banner costs tens of milliseconds (image encoding scales
//! with terminal size); shells ask for one on every startup. The daemon
//! pre-renders per (width, height, image protocol) and this cache makes
//! the display path a single file read.
//!
//! The on-disk format is one JSON file holding a list of entries,
//! rewritten in full on every put. The list is bounded by the number of
//! distinct terminal geometries in use, so the quadratic rewrite is moot.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::fs::write_atomic;

/// One pre-rendered banner, keyed by terminal geometry and image protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BannerEntry {
    /// The fully rendered banner, escape sequences included.
    pub rendered: String,
    /// Terminal width in columns.
    pub width: u16,
    /// Terminal height in rows.
    pub height: u16,
    /// Image protocol the banner was rendered for (`kitty`, `sixel`, `none`, ...).
    pub protocol: String,
    /// When the banner was rendered.
    pub timestamp: DateTime<Utc>,
    /// xxh64 of `rendered`, used to skip byte-identical rewrites.
    pub hash: u64,
}

impl BannerEntry {
    /// Build an entry, computing the content hash.
    #[must_use]
    pub fn new(rendered: String, width: u16, height: u16, protocol: String) -> Self {
        let hash = xxhash_rust::xxh64::xxh64(rendered.as_bytes(), 0);
        Self {
            rendered,
            width,
            height,
            protocol,
            timestamp: Utc::now(),
            hash,
        }
    }

    fn key_matches(&self, width: u16, height: u16, protocol: &str) -> bool {
        self.width == width && self.height == height && self.protocol == protocol
    }
}

/// File-backed banner cache.
#[derive(Debug, Clone)]
pub struct BannerCache {
    path: PathBuf,
}

impl BannerCache {
    /// Create a cache backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> anyhow::Result<Vec<BannerEntry>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("failed to read banner cache"),
        };

        match serde_json::from_slice(&bytes) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // Same corruption policy as the snapshot store: delete and miss
                tracing::warn!(error = %e, "Deleting corrupt banner cache");
                let _ = std::fs::remove_file(&self.path);
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, entries: &[BannerEntry]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(entries).context("failed to serialize banner cache")?;
        write_atomic(&self.path, &bytes, 0o600).context("failed to write banner cache")?;
        Ok(())
    }

    /// Store `entry`, replacing any entry with the same key tuple.
    ///
    /// When the stored entry already has the same content hash the write
    /// is skipped entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be read or rewritten.
    pub fn put(&self, entry: BannerEntry) -> anyhow::Result<()> {
        let mut entries = self.load()?;

        if let Some(existing) = entries
            .iter()
            .find(|e| e.key_matches(entry.width, entry.height, &entry.protocol))
        {
            if existing.hash == entry.hash {
                tracing::debug!(
                    width = entry.width,
                    height = entry.height,
                    protocol = %entry.protocol,
                    "Banner unchanged, skipping rewrite"
                );
                return Ok(());
            }
        }

        entries.retain(|e| !e.key_matches(entry.width, entry.height, &entry.protocol));
        entries.push(entry);
        self.save(&entries)
    }

    /// Look up the banner for a terminal geometry and protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be read.
    pub fn get(&self, width: u16, height: u16, protocol: &str) -> anyhow::Result<Option<BannerEntry>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|e| e.key_matches(width, height, protocol)))
    }

    /// Drop every cached banner.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file exists but cannot be removed.
    pub fn invalidate(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove banner cache"),
        }
    }

    /// True when the cache file is missing or older than `max_age`.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration) -> bool {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_none_or(|age| age > max_age)
    }
}

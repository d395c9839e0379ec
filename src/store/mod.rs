//! Persistent storage for collector snapshots.
//!
//! One JSON file per collector key, written atomically so prompt renderers
//! and the TUI can read concurrently without locks. The store treats file
//! contents as opaque JSON: corruption is detected, logged, and converted
//! into a cache miss by deleting the offending file.

/// Pre-rendered banner cache.
pub mod banner;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::fs::{TMP_PREFIX, ensure_dir, write_atomic};

/// A raw cache read: the stored bytes plus a freshness verdict.
#[derive(Debug, Clone)]
pub struct Cached {
    /// The raw JSON bytes of the snapshot.
    pub bytes: Vec<u8>,
    /// True when the file is younger than the requested TTL.
    pub fresh: bool,
}

/// A typed cache read.
#[derive(Debug, Clone)]
pub struct Typed<T> {
    /// The deserialized snapshot.
    pub value: T,
    /// True when the file is younger than the requested TTL.
    pub fresh: bool,
}

/// Summary of the cache directory contents.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMeta {
    /// Modification time of the most recently written entry.
    pub last_update: Option<DateTime<Utc>>,
    /// File size in bytes per cache key.
    pub sizes: BTreeMap<String, u64>,
}

/// Directory-backed store of per-key JSON snapshots.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open (and create if needed) the cache directory, mode 0700.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or chmodded.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir, 0o700)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// The directory this store owns.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Read the raw snapshot for `key`.
    ///
    /// Returns `None` when the file is missing — and also when it exists
    /// but does not hold valid JSON, in which case the corrupt file is
    /// deleted first. Stale data is still returned; `fresh` tells the
    /// caller whether it is younger than `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures other than "not found".
    pub fn get(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<Cached>> {
        let path = self.entry_path(key);

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read cache entry {key}"));
            }
        };

        if serde_json::from_slice::<serde_json::Value>(&bytes).is_err() {
            tracing::warn!(key = %key, "Deleting corrupt cache entry");
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }

        Ok(Some(Cached {
            fresh: self.is_fresh(&path, ttl),
            bytes,
        }))
    }

    /// Read and deserialize the snapshot for `key` into `T`.
    ///
    /// A deserialization mismatch (schema drift) is handled like
    /// corruption: the file is deleted and the call reports a miss.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures other than "not found".
    pub fn get_typed<T: DeserializeOwned>(
        &self,
        key: &str,
        ttl: Duration,
    ) -> anyhow::Result<Option<Typed<T>>> {
        let Some(cached) = self.get(key, ttl)? else {
            return Ok(None);
        };

        match serde_json::from_slice::<T>(&cached.bytes) {
            Ok(value) => Ok(Some(Typed {
                value,
                fresh: cached.fresh,
            })),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Deleting cache entry with stale schema");
                let _ = std::fs::remove_file(self.entry_path(key));
                Ok(None)
            }
        }
    }

    /// Serialize `value` and atomically replace the snapshot for `key`.
    ///
    /// The JSON is indented so snapshots stay debuggable with `cat`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the atomic write fails.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to serialize cache entry {key}"))?;
        write_atomic(&self.entry_path(key), &bytes, 0o600)
            .with_context(|| format!("failed to write cache entry {key}"))?;
        Ok(())
    }

    /// Typed alias of [`CacheStore::set`].
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the atomic write fails.
    pub fn set_typed<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        self.set(key, value)
    }

    /// Age of the snapshot for `key`, from filesystem metadata only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or its mtime is unreadable.
    pub fn age(&self, key: &str) -> anyhow::Result<Duration> {
        let meta = std::fs::metadata(self.entry_path(key))
            .with_context(|| format!("no cache entry for {key}"))?;
        let modified = meta
            .modified()
            .with_context(|| format!("cache entry {key} has no modification time"))?;
        Ok(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    /// List all stored cache keys, skipping temp files.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be read.
    pub fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir).context("failed to read cache directory")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(stem.to_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Delete every snapshot in the cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a file cannot
    /// be removed.
    pub fn clear(&self) -> anyhow::Result<()> {
        for key in self.keys()? {
            std::fs::remove_file(self.entry_path(&key))
                .with_context(|| format!("failed to remove cache entry {key}"))?;
        }
        Ok(())
    }

    /// Summarize the cache directory from filesystem metadata only.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn meta(&self) -> anyhow::Result<CacheMeta> {
        let mut last_update: Option<DateTime<Utc>> = None;
        let mut sizes = BTreeMap::new();

        for key in self.keys()? {
            let meta = match std::fs::metadata(self.entry_path(&key)) {
                Ok(meta) => meta,
                // Raced with a concurrent delete
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            sizes.insert(key, meta.len());
            if let Ok(modified) = meta.modified() {
                let modified: DateTime<Utc> = modified.into();
                if last_update.is_none_or(|prev| modified > prev) {
                    last_update = Some(modified);
                }
            }
        }

        Ok(CacheMeta { last_update, sizes })
    }

    fn is_fresh(&self, path: &Path, ttl: Duration) -> bool {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age < ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn store() -> (TempDir, CacheStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = CacheStore::new(dir.path().join("cache")).expect("store");
        (dir, store)
    }

    #[test]
    fn test_missing_key_is_a_miss() {
        let (_dir, store) = store();
        assert!(store.get("absent", Duration::from_secs(60)).expect("get").is_none());
    }

    #[test]
    fn test_round_trip_is_fresh() {
        let (_dir, store) = store();
        let value = Sample {
            name: "test".to_owned(),
            count: 42,
        };

        store.set("mykey", &value).expect("set");
        let typed: Typed<Sample> = store
            .get_typed("mykey", Duration::from_secs(3600))
            .expect("get")
            .expect("hit");

        assert!(typed.fresh);
        assert_eq!(typed.value, value);
    }

    #[test]
    fn test_corrupt_entry_is_deleted_and_missed() {
        let (_dir, store) = store();
        store.set("k", &serde_json::json!({"v": 1})).expect("set");

        let path = store.dir().join("k.json");
        std::fs::write(&path, b"{ not json").expect("corrupt");

        assert!(store.get("k", Duration::from_secs(60)).expect("get").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_schema_drift_is_deleted_and_missed() {
        let (_dir, store) = store();
        store.set("k", &serde_json::json!({"other": "shape"})).expect("set");

        let miss: Option<Typed<Sample>> = store
            .get_typed("k", Duration::from_secs(60))
            .expect("get");
        assert!(miss.is_none());
        assert!(!store.dir().join("k.json").exists());
    }

    #[test]
    fn test_keys_skip_temp_and_foreign_files() {
        let (_dir, store) = store();
        store.set("claude", &serde_json::json!({})).expect("set");
        store.set("billing", &serde_json::json!({})).expect("set");
        std::fs::write(store.dir().join(".tmp-claude-abc"), b"x").expect("write");
        std::fs::write(store.dir().join("notes.txt"), b"x").expect("write");

        assert_eq!(store.keys().expect("keys"), vec!["billing", "claude"]);
    }

    #[test]
    fn test_stale_entry_still_returns_bytes() {
        let (_dir, store) = store();
        store.set("x", &serde_json::json!({"v": 1})).expect("set");

        let cached = store
            .get("x", Duration::ZERO)
            .expect("get")
            .expect("hit");
        assert!(!cached.fresh);
        assert!(!cached.bytes.is_empty());
    }

    #[test]
    fn test_meta_reports_sizes() {
        let (_dir, store) = store();
        store.set("claude", &serde_json::json!({"v": 1})).expect("set");

        let meta = store.meta().expect("meta");
        assert!(meta.last_update.is_some());
        assert!(meta.sizes.contains_key("claude"));
        assert!(meta.sizes["claude"] > 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let (_dir, store) = store();
        store.set("a", &serde_json::json!({})).expect("set");
        store.set("b", &serde_json::json!({})).expect("set");

        store.clear().expect("clear");
        assert!(store.keys().expect("keys").is_empty());
    }
}

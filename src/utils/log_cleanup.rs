//! Removal of aged daemon log files.
//!
//! Each daemon start opens a fresh timestamped log file, so the logs
//! directory grows one file per restart forever unless something prunes
//! it. Pruning runs during startup, before the tracing subscriber
//! exists; nothing here logs. The outcome is returned instead, and the
//! caller reports it once logging is up.

use std::path::Path;
use std::time::{Duration, SystemTime};

/// How long pruning keeps a log file around.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What a prune pass deleted, or tried to.
#[derive(Debug, Default)]
pub struct PruneOutcome {
    /// Filenames that were deleted.
    pub removed: Vec<String>,
    /// Filenames past retention that could not be deleted.
    pub failed: Vec<String>,
}

/// Delete files under `logs_dir` named with `prefix` and older than
/// `retention`.
///
/// Only regular files are candidates: symlinks (the `latest.log`
/// pointer) and files without the prefix are never touched, whatever
/// their age.
///
/// # Errors
///
/// Returns an error if `logs_dir` cannot be listed. Per-file failures
/// land in [`PruneOutcome::failed`] instead.
pub fn prune_old_logs(
    logs_dir: &Path,
    prefix: &str,
    retention: Duration,
) -> std::io::Result<PruneOutcome> {
    let mut outcome = PruneOutcome::default();
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return Ok(outcome);
    };

    for entry in std::fs::read_dir(logs_dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(prefix) || entry.path().is_symlink() {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => outcome.removed.push(name.to_owned()),
            Err(_) => outcome.failed.push(name.to_owned()),
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    const PREFIX: &str = "prompt-pulse.";

    fn backdate(path: &Path, age: Duration) {
        let file = OpenOptions::new().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    #[test]
    fn test_fresh_and_foreign_files_survive() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("prompt-pulse.a.log"), b"x").expect("write");
        std::fs::write(dir.path().join("unrelated.log"), b"x").expect("write");

        let outcome =
            prune_old_logs(dir.path(), PREFIX, DEFAULT_RETENTION).expect("prune");
        assert!(outcome.removed.is_empty());
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn test_aged_files_with_prefix_are_removed() {
        let dir = TempDir::new().expect("tempdir");
        let old = dir.path().join("prompt-pulse.old.log");
        let foreign = dir.path().join("keep.log");
        std::fs::write(&old, b"x").expect("write");
        std::fs::write(&foreign, b"x").expect("write");
        backdate(&old, Duration::from_secs(10 * 24 * 3600));
        backdate(&foreign, Duration::from_secs(10 * 24 * 3600));

        let outcome =
            prune_old_logs(dir.path(), PREFIX, DEFAULT_RETENTION).expect("prune");
        assert_eq!(outcome.removed, vec!["prompt-pulse.old.log".to_owned()]);
        assert!(!old.exists());
        assert!(foreign.exists(), "prefix mismatch must protect the file");
    }
}

//! Single-writer enforcement via a PID file.
//!
//! The commit point is an atomic rename: a stale lock (dead PID) is
//! recovered by writing a fresh temp file and renaming it over the old
//! one, so two racing acquirers can never interleave partial writes.

use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

use crate::utils::fs::write_atomic;

/// Errors from PID lock operations.
#[derive(Debug, Error)]
pub enum PidError {
    /// Another live process holds the lock.
    #[error("daemon already running with PID {pid}")]
    Held {
        /// The PID recorded in the lock file.
        pid: i32,
    },

    /// Filesystem failure while reading or writing the lock.
    #[error("PID file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Acquire the daemon lock at `path`, recovering stale locks.
///
/// # Errors
///
/// Returns [`PidError::Held`] when the recorded PID belongs to a live
/// process, or [`PidError::Io`] on filesystem failure.
pub fn acquire(path: &Path) -> Result<(), PidError> {
    if let Some(existing) = read(path)? {
        if is_alive(existing) {
            return Err(PidError::Held { pid: existing });
        }
        tracing::info!(stale_pid = existing, "Recovering stale PID file");
    }

    let pid = std::process::id();
    write_atomic(path, format!("{pid}\n").as_bytes(), 0o644)?;
    tracing::debug!(pid, path = %path.display(), "Acquired PID lock");
    Ok(())
}

/// Best-effort release of the lock at `path`. A missing file is fine.
pub fn release(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Released PID lock"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, "Failed to remove PID file"),
    }
}

/// Read the PID recorded at `path`, if any.
///
/// An unparseable file is treated as absent — it cannot name a live
/// holder, so the caller is free to take the lock over it.
///
/// # Errors
///
/// Returns an error for I/O failures other than "not found".
pub fn read(path: &Path) -> Result<Option<i32>, PidError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(contents.trim().parse::<i32>().ok())
}

/// Probe whether `pid` refers to a live process.
///
/// Sends signal 0. "No such process" means dead; "operation not
/// permitted" means the process exists under another user and counts as
/// alive. Non-positive PIDs are always dead (they would address process
/// groups, never a daemon instance).
#[must_use]
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.pid");

        acquire(&path).expect("acquire");

        let recorded = read(&path).expect("read").expect("some");
        assert_eq!(recorded, i32::try_from(std::process::id()).expect("pid fits"));

        let contents = std::fs::read_to_string(&path).expect("read file");
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn test_acquire_fails_when_holder_alive() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.pid");

        // Current process is definitionally alive
        acquire(&path).expect("first acquire");
        let err = acquire(&path).expect_err("second acquire should fail");
        assert!(matches!(err, PidError::Held { .. }));
    }

    #[test]
    fn test_stale_lock_is_recovered() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.pid");

        // i32::MAX is above any real pid_max
        std::fs::write(&path, "2147483647\n").expect("write stale");

        acquire(&path).expect("acquire over stale lock");
        let recorded = read(&path).expect("read").expect("some");
        assert_eq!(recorded, i32::try_from(std::process::id()).expect("pid fits"));
    }

    #[test]
    fn test_garbage_pid_file_is_recovered() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.pid");
        std::fs::write(&path, "not-a-pid\n").expect("write garbage");

        assert_eq!(read(&path).expect("read"), None);
        acquire(&path).expect("acquire over garbage");
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.pid");

        acquire(&path).expect("acquire");
        release(&path);
        assert!(!path.exists());
        release(&path);
    }

    #[test]
    fn test_non_positive_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
    }

    #[test]
    fn test_lock_held_by_foreign_live_process() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.pid");

        // PID 1 always exists; kill(1, 0) yields EPERM for non-root,
        // which must still count as alive
        std::fs::write(&path, "1\n").expect("write");

        let err = acquire(&path).expect_err("must refuse");
        assert!(matches!(err, PidError::Held { pid: 1 }));

        // The foreign lock was not clobbered
        assert_eq!(read(&path).expect("read"), Some(1));
    }
}

//! Atomic file helpers shared by every on-disk writer in the daemon.
//!
//! All durable documents (cache entries, the health file, the PID file, the
//! banner cache, rewritten credentials) go through [`write_atomic`]: the
//! bytes land in a uniquely named temp file in the destination directory,
//! get their final permissions, and are renamed over the target. A reader
//! racing the writer sees either the old document or the new one, never a
//! truncated mix.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Prefix used for in-flight temp files; directory scans skip it.
pub const TMP_PREFIX: &str = ".tmp-";

/// Write `bytes` to `path` atomically with the given Unix `mode`.
///
/// The temp file is created in the same directory as `path` so the final
/// rename never crosses a filesystem boundary. On any failure the temp file
/// is removed (the `NamedTempFile` drop guard handles crash paths too).
///
/// # Errors
///
/// Returns an error if the temp file cannot be created, written, chmodded,
/// or renamed into place.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path has no parent directory: {}", path.display()),
        )
    })?;

    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("{TMP_PREFIX}{stem}-"))
        .tempfile_in(dir)?;

    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))?;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create `dir` (and parents) if missing, then force its mode to `mode`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or chmodded.
pub fn ensure_dir(dir: &Path, mode: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_file_with_mode() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("out.json");

        write_atomic(&path, b"{\"a\":1}", 0o600).expect("write");

        let meta = std::fs::metadata(&path).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).expect("read"), b"{\"a\":1}");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("out.json");

        write_atomic(&path, b"old", 0o600).expect("write old");
        write_atomic(&path, b"new", 0o600).expect("write new");

        assert_eq!(std::fs::read(&path).expect("read"), b"new");
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("out.json");

        write_atomic(&path, b"data", 0o600).expect("write");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_ensure_dir_sets_mode() {
        let dir = TempDir::new().expect("tempdir");
        let sub = dir.path().join("cache");

        ensure_dir(&sub, 0o700).expect("ensure");

        let meta = std::fs::metadata(&sub).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }
}

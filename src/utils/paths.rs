use std::path::PathBuf;

/// Get the runtime directory for sockets, the PID file, and health output
///
/// Uses `$XDG_RUNTIME_DIR` when set, otherwise a per-user directory under
/// `/tmp` so two users on the same host never collide.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(format!("/tmp/prompt-pulse-{}", users::get_current_uid()))
}

/// Get the cache directory for collector snapshots
///
/// Uses `$XDG_CACHE_HOME/prompt-pulse` when set, otherwise
/// `~/.cache/prompt-pulse`.
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("prompt-pulse");
        }
    }
    #[expect(clippy::expect_used, reason = "home directory is required for operation")]
    dirs::home_dir()
        .expect("Could not find home directory")
        .join(".cache")
        .join("prompt-pulse")
}

/// Get the path to the config file
///
/// Uses `$XDG_CONFIG_HOME/prompt-pulse/config.toml` when set, otherwise
/// `~/.config/prompt-pulse/config.toml`.
#[must_use]
pub fn config_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("prompt-pulse").join("config.toml");
        }
    }
    dirs::home_dir()
        .unwrap_or_default()
        .join(".config")
        .join("prompt-pulse")
        .join("config.toml")
}

/// Get the path to the PID file
#[must_use]
pub fn pid_path() -> PathBuf {
    runtime_dir().join("prompt-pulse.pid")
}

/// Get the path to the Unix socket (for CLI client communication)
#[must_use]
pub fn socket_path() -> PathBuf {
    runtime_dir().join("prompt-pulse.sock")
}

/// Get the path to the published health file
#[must_use]
pub fn health_path() -> PathBuf {
    runtime_dir().join("prompt-pulse-health.json")
}

/// Get the path to the pre-rendered banner cache
#[must_use]
pub fn banner_path() -> PathBuf {
    runtime_dir().join("prompt-pulse-banner.json")
}

/// Filename prefix shared by all daemon log files; pruning keys off it.
pub const LOG_FILE_PREFIX: &str = "prompt-pulse.";

/// Get the directory for daemon log files
#[must_use]
pub fn logs_dir() -> PathBuf {
    cache_dir().join("logs")
}

/// Get the default Claude Code credentials file path
#[must_use]
pub fn default_claude_credentials_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".claude")
        .join(".credentials.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_paths_share_a_directory() {
        let dir = runtime_dir();
        assert!(pid_path().starts_with(&dir));
        assert!(socket_path().starts_with(&dir));
        assert!(health_path().starts_with(&dir));
        assert!(banner_path().starts_with(&dir));
    }

    #[test]
    fn test_runtime_filenames() {
        assert_eq!(
            pid_path().file_name().and_then(|n| n.to_str()),
            Some("prompt-pulse.pid")
        );
        assert_eq!(
            health_path().file_name().and_then(|n| n.to_str()),
            Some("prompt-pulse-health.json")
        );
    }
}

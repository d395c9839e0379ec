//! Application configuration loading.
//!
//! The daemon consumes a typed [`Config`]; this module is the thin edge
//! that produces one. Values resolve with priority: environment →
//! config file (TOML) → built-in defaults. A missing config file is not
//! an error — everything has a sane default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::collectors::claude::types::AccountType;
use crate::collectors::claude::{ClaudeAccount, DEFAULT_INTERVAL, DEFAULT_STAGGER};
use crate::utils::paths;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Daemon-wide knobs.
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Claude collector configuration.
    #[serde(default)]
    pub claude: ClaudeConfig,
}

/// Daemon-wide knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Override for the snapshot cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Override for the runtime directory (sockets, PID, health).
    pub runtime_dir: Option<PathBuf>,
    /// Seconds between health file republications.
    pub health_interval_secs: u64,
    /// Minutes after which an unrefreshed health file means "dead".
    pub health_stale_after_mins: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            runtime_dir: None,
            health_interval_secs: 30,
            health_stale_after_mins: 15,
        }
    }
}

/// Claude collector configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    /// Disable to drop the collector entirely.
    pub enabled: bool,
    /// Minutes between collection runs.
    pub interval_mins: u64,
    /// Seconds between sequential per-account requests.
    pub stagger_secs: u64,
    /// Accounts to collect, in priority order.
    pub accounts: Vec<AccountConfig>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_mins: DEFAULT_INTERVAL.as_secs() / 60,
            stagger_secs: DEFAULT_STAGGER.as_secs(),
            accounts: Vec::new(),
        }
    }
}

impl ClaudeConfig {
    /// Collection cadence as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_mins * 60)
    }

    /// Stagger delay as a duration.
    #[must_use]
    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    /// Runtime account descriptions.
    ///
    /// With no accounts configured, falls back to a single subscription
    /// account using the CLI's default credentials file — the common
    /// single-user setup needs no config at all.
    #[must_use]
    pub fn accounts(&self) -> Vec<ClaudeAccount> {
        if self.accounts.is_empty() {
            return vec![ClaudeAccount {
                name: "default".to_owned(),
                account_type: AccountType::Subscription,
                credentials_path: None,
                api_key_env: None,
                enabled: true,
                priority: 0,
                short_name: None,
                tier_hint: None,
            }];
        }

        self.accounts
            .iter()
            .map(|a| ClaudeAccount {
                name: a.name.clone(),
                account_type: a.account_type,
                credentials_path: a.credentials_path.clone(),
                api_key_env: a.api_key_env.clone(),
                enabled: a.enabled,
                priority: a.priority,
                short_name: a.short_name.clone(),
                tier_hint: a.tier_hint.clone(),
            })
            .collect()
    }
}

/// One configured Claude account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// User-facing label.
    pub name: String,
    /// `subscription` (OAuth file) or `api` (env key).
    #[serde(rename = "type", default = "default_account_type")]
    pub account_type: AccountType,
    /// Credentials file override (subscription accounts).
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    /// Env var holding the API key (API accounts).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Disabled accounts are silently skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Collection order; lower runs first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Compact label for narrow displays.
    #[serde(default)]
    pub short_name: Option<String>,
    /// Tier to assume when credentials don't carry one.
    #[serde(default)]
    pub tier_hint: Option<String>,
}

fn default_account_type() -> AccountType {
    AccountType::Subscription
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

impl Config {
    /// Load configuration from `path` (default: the XDG config path).
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map_or_else(paths::config_path, Path::to_path_buf);

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config at {}", path.display()));
            }
        };

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// The snapshot cache directory: env → config → XDG default.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("PROMPT_PULSE_CACHE_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        self.daemon
            .cache_dir
            .clone()
            .unwrap_or_else(paths::cache_dir)
    }

    /// The runtime directory: env → config → XDG default.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("PROMPT_PULSE_RUNTIME_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        self.daemon
            .runtime_dir
            .clone()
            .unwrap_or_else(paths::runtime_dir)
    }

    /// Path of the PID file under the resolved runtime directory.
    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.runtime_dir().join("prompt-pulse.pid")
    }

    /// Path of the Unix command socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir().join("prompt-pulse.sock")
    }

    /// Path of the published health file.
    #[must_use]
    pub fn health_path(&self) -> PathBuf {
        self.runtime_dir().join("prompt-pulse-health.json")
    }

    /// Path of the banner cache file.
    #[must_use]
    pub fn banner_path(&self) -> PathBuf {
        self.runtime_dir().join("prompt-pulse-banner.json")
    }

    /// Health republish cadence.
    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.health_interval_secs)
    }

    /// Staleness threshold for external health readers.
    #[must_use]
    pub fn health_stale_after(&self) -> Duration {
        Duration::from_secs(self.daemon.health_stale_after_mins * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert!(config.claude.enabled);
        assert_eq!(config.claude.interval(), Duration::from_secs(900));
        assert_eq!(config.claude.stagger(), Duration::from_secs(5));
        assert_eq!(config.health_interval(), Duration::from_secs(30));
        assert_eq!(config.health_stale_after(), Duration::from_secs(900));
    }

    #[test]
    fn test_default_account_when_none_configured() {
        let config = Config::default();
        let accounts = config.claude.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "default");
        assert_eq!(accounts[0].account_type, AccountType::Subscription);
        assert!(accounts[0].enabled);
    }

    #[test]
    fn test_parse_full_document() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            cache_dir = "/tmp/pp-cache"
            health_interval_secs = 60

            [claude]
            interval_mins = 5
            stagger_secs = 2

            [[claude.accounts]]
            name = "work"
            type = "subscription"
            credentials_path = "/home/u/.claude/.credentials.json"
            priority = 1
            tier_hint = "max_20x"

            [[claude.accounts]]
            name = "api"
            type = "api"
            api_key_env = "ANTHROPIC_ADMIN_KEY"
            enabled = false
            "#,
        )
        .expect("parse");

        assert_eq!(config.daemon.health_interval_secs, 60);
        assert_eq!(config.claude.interval(), Duration::from_secs(300));

        let accounts = config.claude.accounts();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].name, "work");
        assert_eq!(accounts[0].priority, 1);
        assert_eq!(accounts[1].account_type, AccountType::Api);
        assert!(!accounts[1].enabled);
        assert_eq!(accounts[1].priority, 100);
    }

    #[test]
    fn test_load_missing_file_is_defaults() {
        let config =
            Config::load(Some(Path::new("/nonexistent/prompt-pulse.toml"))).expect("load");
        assert!(config.claude.enabled);
    }
}

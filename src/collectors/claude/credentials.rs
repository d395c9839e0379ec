//! OAuth credential loading, refresh, and atomic persistence.
//!
//! Credentials live in a JSON file written by the Claude Code CLI under a
//! `claudeAiOauth` key. The daemon reads them fresh at the start of every
//! collection run, refreshes them when they are close to expiry, and
//! rewrites the file atomically — preserving any sibling keys other tools
//! may have stored in the same document.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::utils::fs::write_atomic;

/// Refresh when the token expires within this window.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Timeout for the token refresh POST.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth token endpoint.
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// OAuth client ID registered for the Claude Code CLI.
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Key under which the credential object lives in the credentials file.
const CREDENTIALS_KEY: &str = "claudeAiOauth";

/// One OAuth credential as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredential {
    /// Bearer token for API calls.
    pub access_token: String,
    /// Token used to mint a new access token; absent on some accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry as Unix epoch milliseconds.
    pub expires_at: i64,
    /// Granted OAuth scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Subscription kind as reported by the CLI (`pro`, `max`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    /// Raw upstream tier identifier, normalized later for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_tier: Option<String>,
}

impl OAuthCredential {
    /// True when the token expires within `window` from now.
    #[must_use]
    pub fn expires_within(&self, window: Duration) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        now_ms + i64::try_from(window.as_millis()).unwrap_or(i64::MAX) >= self.expires_at
    }

    /// True when the token is already expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires_at
    }
}

/// Loads credentials from disk at the start of each collection run.
#[async_trait]
pub trait CredentialLoader: Send + Sync {
    /// Load the credential stored at `path`.
    async fn load(&self, path: &Path) -> anyhow::Result<OAuthCredential>;
}

/// Refreshes a near-expiry credential and persists the replacement.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange `current`'s refresh token for new tokens, rewrite the
    /// file at `path`, and return the refreshed credential.
    async fn refresh(&self, path: &Path, current: &OAuthCredential)
    -> anyhow::Result<OAuthCredential>;
}

/// Production loader reading the CLI's credentials file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileCredentialLoader;

#[async_trait]
impl CredentialLoader for FileCredentialLoader {
    async fn load(&self, path: &Path) -> anyhow::Result<OAuthCredential> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read credentials at {}", path.display()))?;

        // Loose permissions are worth a warning but not a refusal
        if let Ok(meta) = std::fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{mode:o}"),
                    "Credentials file is readable by other users"
                );
            }
        }

        let doc: serde_json::Value =
            serde_json::from_slice(&bytes).context("credentials file is not valid JSON")?;
        let oauth = doc
            .get(CREDENTIALS_KEY)
            .with_context(|| format!("credentials file has no {CREDENTIALS_KEY} key"))?;

        serde_json::from_value(oauth.clone()).context("credentials file has unexpected shape")
    }
}

/// Rewrite the credentials file at `path` with `cred`, preserving any
/// sibling keys in the surrounding document.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or rewritten.
pub fn persist_credentials(path: &Path, cred: &OAuthCredential) -> anyhow::Result<()> {
    let mut doc: serde_json::Value = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| serde_json::json!({})),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::json!({}),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to re-read credentials at {}", path.display()));
        }
    };
    if !doc.is_object() {
        doc = serde_json::json!({});
    }

    doc[CREDENTIALS_KEY] = serde_json::to_value(cred).context("failed to serialize credential")?;

    let bytes = serde_json::to_vec_pretty(&doc).context("failed to serialize credentials file")?;
    write_atomic(path, &bytes, 0o600)
        .with_context(|| format!("failed to write credentials at {}", path.display()))?;
    Ok(())
}

/// Response shape of the OAuth token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime of the new access token in seconds.
    expires_in: i64,
}

/// Production refresher speaking the OAuth `refresh_token` grant.
#[derive(Debug, Clone)]
pub struct OAuthTokenRefresher {
    client: reqwest::Client,
    token_url: String,
}

impl OAuthTokenRefresher {
    /// Build a refresher against the production token endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(REFRESH_TIMEOUT)
                .build()
                .context("failed to build refresh HTTP client")?,
            token_url: TOKEN_URL.to_owned(),
        })
    }

    /// Build a refresher against an alternate endpoint (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_token_url(token_url: impl Into<String>) -> anyhow::Result<Self> {
        let mut refresher = Self::new()?;
        refresher.token_url = token_url.into();
        Ok(refresher)
    }
}

#[async_trait]
impl TokenRefresher for OAuthTokenRefresher {
    async fn refresh(
        &self,
        path: &Path,
        current: &OAuthCredential,
    ) -> anyhow::Result<OAuthCredential> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .context("no refresh token available")?;

        let response = self
            .client
            .post(&self.token_url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": CLIENT_ID,
            }))
            .send()
            .await
            .context("token refresh request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token refresh rejected: {status} - {body}");
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .context("failed to parse token refresh response")?;

        let mut refreshed = current.clone();
        refreshed.access_token = tokens.access_token;
        if tokens.refresh_token.is_some() {
            refreshed.refresh_token = tokens.refresh_token;
        }
        refreshed.expires_at = Utc::now().timestamp_millis() + tokens.expires_in * 1000;

        persist_credentials(path, &refreshed).context("failed to persist refreshed credentials")?;
        tracing::info!(path = %path.display(), "Refreshed OAuth credentials");

        Ok(refreshed)
    }
}

/// Resolve a secret from the environment.
///
/// Reads `$name` first; if unset or empty, reads `$<name>_FILE` as a path
/// and returns the first non-empty line of that file (secret-manager
/// integrations mount secrets as files).
#[must_use]
pub fn secret_from_env(name: &str) -> Option<String> {
    secret_from_lookup(name, |var| std::env::var(var).ok())
}

/// [`secret_from_env`] with an injectable variable lookup.
fn secret_from_lookup(
    name: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    if let Some(value) = lookup(name) {
        if !value.trim().is_empty() {
            return Some(value.trim().to_owned());
        }
    }

    let path = lookup(&format!("{name}_FILE"))?;
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}

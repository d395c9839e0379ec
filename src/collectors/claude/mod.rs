//! Claude usage collector.
//!
//! Fans out over the configured accounts sequentially with a stagger
//! delay between requests — the upstream API rate-limits per IP, and a
//! burst of N concurrent probes provokes exactly the 429s the retry
//! transport exists to avoid. A failing account never aborts the run;
//! every account yields a record, degraded if necessary.

/// HTTP probes for quota and rate-limit data.
pub mod client;
/// OAuth credential loading, refresh, and persistence.
pub mod credentials;
/// Snapshot types.
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::errors::FetchError;
use crate::utils::paths::default_claude_credentials_path;

use super::{CollectResult, Collector};
use client::{HttpRateLimitFetcher, HttpUsageFetcher, RateLimitFetcher, UsageFetcher};
use credentials::{
    CredentialLoader, FileCredentialLoader, OAuthTokenRefresher, REFRESH_WINDOW, TokenRefresher,
    secret_from_env,
};
use types::{AccountStatus, AccountType, ClaudeAccountUsage, ClaudeUsage, normalize_tier};

/// Default collection cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Default pause between sequential per-account requests.
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(5);

/// Env var consulted when an API account names none.
const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Resolves an API key by environment variable name.
pub type SecretLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Runtime description of one Claude account.
#[derive(Debug, Clone)]
pub struct ClaudeAccount {
    /// User-facing label.
    pub name: String,
    /// How the account authenticates.
    pub account_type: AccountType,
    /// Credentials file override (subscription accounts).
    pub credentials_path: Option<PathBuf>,
    /// Name of the env var holding the key (API accounts).
    pub api_key_env: Option<String>,
    /// Disabled accounts are silently skipped.
    pub enabled: bool,
    /// Collection order; lower runs first.
    pub priority: u32,
    /// Compact label for narrow displays.
    pub short_name: Option<String>,
    /// Tier to assume when the credentials don't carry one.
    pub tier_hint: Option<String>,
}

/// Multi-account Claude usage collector.
pub struct ClaudeCollector {
    accounts: Vec<ClaudeAccount>,
    stagger: Duration,
    interval: Duration,
    loader: Arc<dyn CredentialLoader>,
    refresher: Arc<dyn TokenRefresher>,
    usage: Arc<dyn UsageFetcher>,
    rate_limits: Arc<dyn RateLimitFetcher>,
    secrets: Arc<SecretLookup>,
}

impl std::fmt::Debug for ClaudeCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeCollector")
            .field("accounts", &self.accounts.len())
            .field("stagger", &self.stagger)
            .finish_non_exhaustive()
    }
}

impl ClaudeCollector {
    /// Build a collector with production credential and HTTP plumbing.
    ///
    /// `cancel` scopes the retry transport's backoff sleeps to daemon
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be constructed.
    pub fn new(
        accounts: Vec<ClaudeAccount>,
        stagger: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            accounts,
            stagger,
            interval,
            loader: Arc::new(FileCredentialLoader),
            refresher: Arc::new(OAuthTokenRefresher::new()?),
            usage: Arc::new(HttpUsageFetcher::new(cancel.clone())?),
            rate_limits: Arc::new(HttpRateLimitFetcher::new(cancel)?),
            secrets: Arc::new(secret_from_env),
        })
    }

    /// Build a collector with explicit seams, for tests.
    #[must_use]
    pub fn with_parts(
        accounts: Vec<ClaudeAccount>,
        stagger: Duration,
        interval: Duration,
        loader: Arc<dyn CredentialLoader>,
        refresher: Arc<dyn TokenRefresher>,
        usage: Arc<dyn UsageFetcher>,
        rate_limits: Arc<dyn RateLimitFetcher>,
        secrets: Arc<SecretLookup>,
    ) -> Self {
        Self {
            accounts,
            stagger,
            interval,
            loader,
            refresher,
            usage,
            rate_limits,
            secrets,
        }
    }

    async fn collect_subscription(
        &self,
        account: &ClaudeAccount,
        warnings: &mut Vec<String>,
    ) -> anyhow::Result<ClaudeAccountUsage> {
        let path = account
            .credentials_path
            .clone()
            .unwrap_or_else(default_claude_credentials_path);

        let mut cred = match self.loader.load(&path).await {
            Ok(cred) => cred,
            Err(e) => {
                warnings.push(format!("{}: credential load failed: {e:#}", account.name));
                return Ok(ClaudeAccountUsage::failed(
                    &account.name,
                    AccountType::Subscription,
                    AccountStatus::AuthFailed,
                    format!("{e:#}"),
                ));
            }
        };

        let tier = Some(normalize_tier(
            cred.rate_limit_tier
                .as_deref()
                .or(account.tier_hint.as_deref())
                .unwrap_or(""),
        ));

        if cred.expires_within(REFRESH_WINDOW) {
            if cred.refresh_token.is_none() {
                warnings.push(format!(
                    "{}: token expired with no refresh token",
                    account.name
                ));
                return Ok(ClaudeAccountUsage {
                    tier,
                    ..ClaudeAccountUsage::failed(
                        &account.name,
                        AccountType::Subscription,
                        AccountStatus::TokenExpired,
                        "token expired with no refresh token",
                    )
                });
            }

            match self.refresher.refresh(&path, &cred).await {
                Ok(refreshed) => cred = refreshed,
                Err(e) if cred.is_expired() => {
                    warnings.push(format!("{}: token refresh failed: {e:#}", account.name));
                    return Ok(ClaudeAccountUsage {
                        tier,
                        ..ClaudeAccountUsage::failed(
                            &account.name,
                            AccountType::Subscription,
                            AccountStatus::TokenExpired,
                            format!("refresh failed: {e:#}"),
                        )
                    });
                }
                Err(e) => {
                    // Token still valid for a few minutes; ride it out
                    warnings.push(format!(
                        "{}: token refresh failed, continuing with current token: {e:#}",
                        account.name
                    ));
                }
            }
        }

        match self.usage.fetch(&cred.access_token).await {
            Ok(usage) => Ok(ClaudeAccountUsage {
                name: account.name.clone(),
                account_type: AccountType::Subscription,
                tier,
                status: AccountStatus::Ok,
                error_reason: None,
                subscription: Some(usage),
                rate_limits: None,
            }),
            Err(FetchError::Cancelled) => anyhow::bail!("collection cancelled"),
            Err(e @ (FetchError::Auth(_) | FetchError::RateLimited(_))) => {
                warnings.push(format!("{}: usage fetch failed: {e}", account.name));
                Ok(ClaudeAccountUsage {
                    tier,
                    ..ClaudeAccountUsage::failed(
                        &account.name,
                        AccountType::Subscription,
                        status_for_error(&e),
                        e.to_string(),
                    )
                })
            }
            Err(e) => {
                // Credential metadata is still worth showing; degrade
                // instead of hiding the account.
                warnings.push(format!("{}: usage fetch failed: {e}", account.name));
                Ok(ClaudeAccountUsage {
                    name: account.name.clone(),
                    account_type: AccountType::Subscription,
                    tier,
                    status: AccountStatus::Active,
                    error_reason: Some(e.to_string()),
                    subscription: None,
                    rate_limits: None,
                })
            }
        }
    }

    async fn collect_api(
        &self,
        account: &ClaudeAccount,
        warnings: &mut Vec<String>,
    ) -> anyhow::Result<ClaudeAccountUsage> {
        let env_name = account.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV);

        let Some(api_key) = (self.secrets)(env_name) else {
            warnings.push(format!(
                "{}: environment variable {env_name} is not set",
                account.name
            ));
            return Ok(ClaudeAccountUsage::failed(
                &account.name,
                AccountType::Api,
                AccountStatus::AuthFailed,
                format!("environment variable {env_name} is not set"),
            ));
        };

        match self.rate_limits.probe(&api_key).await {
            Ok(probe) => {
                let error_reason = (probe.status != AccountStatus::Ok)
                    .then(|| format!("probe returned {:?}", probe.status));
                if let Some(reason) = &error_reason {
                    warnings.push(format!("{}: {reason}", account.name));
                }
                Ok(ClaudeAccountUsage {
                    name: account.name.clone(),
                    account_type: AccountType::Api,
                    tier: account.tier_hint.as_deref().map(normalize_tier),
                    status: probe.status,
                    error_reason,
                    subscription: None,
                    rate_limits: Some(probe.rate_limits),
                })
            }
            Err(FetchError::Cancelled) => anyhow::bail!("collection cancelled"),
            Err(e) => {
                warnings.push(format!("{}: probe failed: {e}", account.name));
                Ok(ClaudeAccountUsage::failed(
                    &account.name,
                    AccountType::Api,
                    status_for_error(&e),
                    e.to_string(),
                ))
            }
        }
    }
}

/// Map a classified fetch error to the per-account status it produces.
fn status_for_error(err: &FetchError) -> AccountStatus {
    match err {
        FetchError::Auth(_) => AccountStatus::AuthFailed,
        FetchError::RateLimited(_) => AccountStatus::RateLimited,
        FetchError::Cloudflare(_) => AccountStatus::Cloudflare,
        FetchError::Network(_) => AccountStatus::NetworkError,
        FetchError::Server(_) | FetchError::Schema(_) | FetchError::Cancelled => {
            AccountStatus::Error
        }
    }
}

#[async_trait]
impl Collector for ClaudeCollector {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn description(&self) -> &'static str {
        "Claude subscription quotas and API rate limits"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&self, cancel: CancellationToken) -> anyhow::Result<CollectResult> {
        if cancel.is_cancelled() {
            anyhow::bail!("collection cancelled");
        }

        let timestamp = Utc::now();

        let mut enabled: Vec<&ClaudeAccount> =
            self.accounts.iter().filter(|a| a.enabled).collect();
        // Stable sort keeps configuration order within equal priorities
        enabled.sort_by_key(|a| a.priority);

        let mut results = Vec::with_capacity(enabled.len());
        let mut warnings = Vec::new();

        for (index, account) in enabled.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    () = cancel.cancelled() => anyhow::bail!("collection cancelled"),
                    () = tokio::time::sleep(self.stagger) => {}
                }
            }
            if cancel.is_cancelled() {
                anyhow::bail!("collection cancelled");
            }

            let usage = match account.account_type {
                AccountType::Subscription => {
                    self.collect_subscription(account, &mut warnings).await?
                }
                AccountType::Api => self.collect_api(account, &mut warnings).await?,
            };
            results.push(usage);
        }

        Ok(CollectResult {
            collector: self.name().to_owned(),
            timestamp,
            data: serde_json::to_value(ClaudeUsage { accounts: results })?,
            warnings,
        })
    }
}

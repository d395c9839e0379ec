//! Snapshot types for Claude account usage.

use serde::{Deserialize, Serialize};

/// How an account authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// OAuth credentials on disk, written by the Claude Code CLI.
    Subscription,
    /// An API key injected through an environment variable.
    Api,
}

/// Per-account outcome of one collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Live quota data retrieved.
    Ok,
    /// Credentials are valid but the quota API was unreachable.
    Active,
    /// Credentials rejected or unloadable.
    AuthFailed,
    /// Token expired with no way to refresh it.
    TokenExpired,
    /// Upstream throttled us past the retry budget.
    RateLimited,
    /// Connection-level failure.
    NetworkError,
    /// Anti-bot interstitial; unrecoverable without a human.
    Cloudflare,
    /// Anything else, including upstream 5xx.
    Error,
}

/// A usage window expressed as percent consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// Percent of the window's limit consumed, 0-100.
    pub percent_used: f64,
    /// When the window resets, RFC3339, as reported upstream.
    pub resets_at: Option<String>,
}

/// Extra-usage credit tracker for subscription accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraCredits {
    /// Credits consumed.
    pub used: f64,
    /// Credit ceiling.
    pub limit: f64,
    /// `used / limit` as a percentage.
    pub percent_used: f64,
}

/// Quota blocks for a subscription account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionUsage {
    /// The rolling 5-hour message window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub five_hour: Option<UsageWindow>,
    /// The rolling 7-day window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seven_day: Option<UsageWindow>,
    /// Extra-usage credits, when enabled on the account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_credits: Option<ExtraCredits>,
}

/// Rate-limit headers captured from an API probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    /// Requests allowed per window.
    pub requests_limit: Option<u64>,
    /// Requests remaining in the current window.
    pub requests_remaining: Option<u64>,
    /// When the request window resets, RFC3339.
    pub requests_reset: Option<String>,
    /// Tokens allowed per window.
    pub tokens_limit: Option<u64>,
    /// Tokens remaining in the current window.
    pub tokens_remaining: Option<u64>,
    /// When the token window resets, RFC3339.
    pub tokens_reset: Option<String>,
}

impl RateLimitSnapshot {
    /// True when no header was captured at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests_limit.is_none()
            && self.requests_remaining.is_none()
            && self.tokens_limit.is_none()
            && self.tokens_remaining.is_none()
    }
}

/// The canonical per-account record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeAccountUsage {
    /// User-facing account label.
    pub name: String,
    /// How the account authenticates.
    #[serde(rename = "type")]
    pub account_type: AccountType,
    /// Normalized subscription tier (`pro`, `max_5x`, `max_20x`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Outcome of this run.
    pub status: AccountStatus,
    /// Failure detail when `status` is not `ok`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Subscription quota blocks (subscription accounts only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionUsage>,
    /// API rate-limit snapshot (API accounts only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitSnapshot>,
}

impl ClaudeAccountUsage {
    /// A record carrying only identity and a failure status.
    #[must_use]
    pub fn failed(
        name: impl Into<String>,
        account_type: AccountType,
        status: AccountStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            account_type,
            tier: None,
            status,
            error_reason: Some(reason.into()),
            subscription: None,
            rate_limits: None,
        }
    }
}

/// The collector's full output: one entry per configured account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeUsage {
    /// Per-account results in configuration (priority) order.
    pub accounts: Vec<ClaudeAccountUsage>,
}

/// Normalize an upstream `rateLimitTier` value to a short display tier.
///
/// Unknown values pass through unchanged; the empty string defaults to
/// `pro`. Idempotent: normalizing an already-normalized value is a no-op.
#[must_use]
pub fn normalize_tier(raw: &str) -> String {
    match raw {
        "" => "pro".to_owned(),
        "default_claude_pro" => "pro".to_owned(),
        "default_claude_max_5x" => "max_5x".to_owned(),
        "default_claude_max_20x" => "max_20x".to_owned(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_table() {
        assert_eq!(normalize_tier("default_claude_pro"), "pro");
        assert_eq!(normalize_tier("default_claude_max_5x"), "max_5x");
        assert_eq!(normalize_tier("default_claude_max_20x"), "max_20x");
    }

    #[test]
    fn test_tier_empty_defaults_to_pro() {
        assert_eq!(normalize_tier(""), "pro");
    }

    #[test]
    fn test_tier_unknown_passes_through() {
        assert_eq!(normalize_tier("enterprise_tier_9"), "enterprise_tier_9");
    }

    #[test]
    fn test_tier_normalization_is_idempotent() {
        for raw in ["", "default_claude_pro", "default_claude_max_20x", "weird"] {
            let once = normalize_tier(raw);
            assert_eq!(normalize_tier(&once), once);
        }
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&AccountStatus::TokenExpired).expect("serialize");
        assert_eq!(json, "\"token_expired\"");
        let json = serde_json::to_string(&AccountStatus::RateLimited).expect("serialize");
        assert_eq!(json, "\"rate_limited\"");
    }

    #[test]
    fn test_account_type_field_name_is_type() {
        let usage = ClaudeAccountUsage::failed("a", AccountType::Api, AccountStatus::AuthFailed, "x");
        let value = serde_json::to_value(&usage).expect("serialize");
        assert_eq!(value["type"], "api");
    }
}

//! HTTP probes against the Anthropic APIs.
//!
//! Two seams: [`UsageFetcher`] pulls subscription quota windows for an
//! OAuth access token, [`RateLimitFetcher`] fires the cheapest possible
//! API call purely to harvest rate-limit headers. Both ride the retry
//! transport so transient throttling is absorbed before classification.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::errors::FetchError;
use crate::transport::{RetryConfig, RetryTransport, TransportError};

use super::types::{AccountStatus, RateLimitSnapshot, SubscriptionUsage, UsageWindow};

/// Timeout for quota fetches.
const USAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Responses beyond this size are rejected as malformed.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Production API base.
const API_BASE: &str = "https://api.anthropic.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Cheapest model for a probe whose only purpose is header extraction.
const PROBE_MODEL: &str = "claude-3-5-haiku-latest";

/// Fetches subscription quota windows.
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    /// Fetch the usage blocks visible to `access_token`.
    async fn fetch(&self, access_token: &str) -> Result<SubscriptionUsage, FetchError>;
}

/// Outcome of an API-key probe: a status plus whatever headers came back.
#[derive(Debug, Clone)]
pub struct ApiProbe {
    /// Status derived from the probe's HTTP status code.
    pub status: AccountStatus,
    /// Rate-limit headers, captured on success and failure alike.
    pub rate_limits: RateLimitSnapshot,
}

/// Probes an API key for rate-limit headers.
#[async_trait]
pub trait RateLimitFetcher: Send + Sync {
    /// Issue the probe and capture rate-limit headers.
    async fn probe(&self, api_key: &str) -> Result<ApiProbe, FetchError>;
}

fn transport_error(err: TransportError) -> FetchError {
    match err {
        TransportError::Cancelled => FetchError::Cancelled,
        TransportError::UnreplayableBody => {
            FetchError::Network("request body not replayable".to_owned())
        }
        TransportError::Http(e) => FetchError::from_transport(&e),
    }
}

fn build_transport(cancel: CancellationToken) -> Result<RetryTransport, FetchError> {
    let client = reqwest::Client::builder()
        .timeout(USAGE_TIMEOUT)
        .build()
        .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;
    Ok(RetryTransport::new(client, RetryConfig::default(), cancel))
}

async fn read_capped(response: reqwest::Response) -> Result<(u16, String), FetchError> {
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::from_transport(&e))?;
    if bytes.len() > MAX_RESPONSE_BYTES {
        return Err(FetchError::Schema(format!(
            "response too large: {} bytes",
            bytes.len()
        )));
    }
    Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
}

/// Wire shape of the subscription usage endpoint.
#[derive(Debug, serde::Deserialize)]
struct RawUsageResponse {
    five_hour: Option<RawWindow>,
    seven_day: Option<RawWindow>,
    extra_usage: Option<RawCredits>,
}

#[derive(Debug, serde::Deserialize)]
struct RawWindow {
    #[serde(default)]
    current: f64,
    #[serde(default)]
    limit: f64,
    resets_at: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct RawCredits {
    #[serde(default)]
    used: f64,
    #[serde(default)]
    limit: f64,
}

impl RawUsageResponse {
    /// Convert raw windows to percentages; a zero limit suppresses the
    /// block instead of dividing by it.
    fn into_usage(self) -> SubscriptionUsage {
        let window = |raw: RawWindow| {
            (raw.limit > 0.0).then(|| UsageWindow {
                percent_used: raw.current / raw.limit * 100.0,
                resets_at: raw.resets_at,
            })
        };

        SubscriptionUsage {
            five_hour: self.five_hour.and_then(window),
            seven_day: self.seven_day.and_then(window),
            extra_credits: self.extra_usage.and_then(|raw| {
                (raw.limit > 0.0).then(|| super::types::ExtraCredits {
                    used: raw.used,
                    limit: raw.limit,
                    percent_used: raw.used / raw.limit * 100.0,
                })
            }),
        }
    }
}

/// Production usage fetcher.
#[derive(Debug, Clone)]
pub struct HttpUsageFetcher {
    transport: RetryTransport,
    base_url: String,
}

impl HttpUsageFetcher {
    /// Build a fetcher against the production API.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(cancel: CancellationToken) -> Result<Self, FetchError> {
        Ok(Self {
            transport: build_transport(cancel)?,
            base_url: API_BASE.to_owned(),
        })
    }

    /// Build a fetcher against an alternate base URL (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_base_url(
        base_url: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            transport: build_transport(cancel)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl UsageFetcher for HttpUsageFetcher {
    async fn fetch(&self, access_token: &str) -> Result<SubscriptionUsage, FetchError> {
        let request = self
            .transport
            .client()
            .get(format!("{}/api/oauth/usage", self.base_url))
            .bearer_auth(access_token)
            .header("anthropic-beta", "oauth-2025-04-20")
            .header(
                "User-Agent",
                format!("prompt-pulse/{}", env!("CARGO_PKG_VERSION")),
            )
            .build()
            .map_err(|e| FetchError::from_transport(&e))?;

        let response = self.transport.execute(request).await.map_err(transport_error)?;
        let (status, body) = read_capped(response).await?;

        if !(200..300).contains(&status) {
            return Err(FetchError::from_response(status, &body));
        }

        let raw: RawUsageResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Schema(format!("usage response: {e}")))?;
        Ok(raw.into_usage())
    }
}

/// Production rate-limit prober.
#[derive(Debug, Clone)]
pub struct HttpRateLimitFetcher {
    transport: RetryTransport,
    base_url: String,
}

impl HttpRateLimitFetcher {
    /// Build a prober against the production API.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(cancel: CancellationToken) -> Result<Self, FetchError> {
        Ok(Self {
            transport: build_transport(cancel)?,
            base_url: API_BASE.to_owned(),
        })
    }

    /// Build a prober against an alternate base URL (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_base_url(
        base_url: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            transport: build_transport(cancel)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl RateLimitFetcher for HttpRateLimitFetcher {
    async fn probe(&self, api_key: &str) -> Result<ApiProbe, FetchError> {
        let request = self
            .transport
            .client()
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&serde_json::json!({
                "model": PROBE_MODEL,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "."}],
            }))
            .build()
            .map_err(|e| FetchError::from_transport(&e))?;

        let response = self.transport.execute(request).await.map_err(transport_error)?;
        let rate_limits = parse_rate_limit_headers(response.headers());
        let (status, body) = read_capped(response).await?;

        let probe_status = match status {
            s if (200..300).contains(&s) => AccountStatus::Ok,
            401 | 403 => AccountStatus::AuthFailed,
            429 => AccountStatus::RateLimited,
            s => return Err(FetchError::from_response(s, &body)),
        };

        Ok(ApiProbe {
            status: probe_status,
            rate_limits,
        })
    }
}

/// Extract the `anthropic-ratelimit-*` header family.
#[must_use]
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitSnapshot {
    let num = |name: &str| -> Option<u64> {
        headers
            .get(name)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    };
    let text = |name: &str| -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    RateLimitSnapshot {
        requests_limit: num("anthropic-ratelimit-requests-limit"),
        requests_remaining: num("anthropic-ratelimit-requests-remaining"),
        requests_reset: text("anthropic-ratelimit-requests-reset"),
        tokens_limit: num("anthropic-ratelimit-tokens-limit"),
        tokens_remaining: num("anthropic-ratelimit-tokens-remaining"),
        tokens_reset: text("anthropic-ratelimit-tokens-reset"),
    }
}

//! Failure classification for upstream API probes.
//!
//! Collectors never surface raw HTTP failures; every error is folded into
//! one of these kinds first, and the kind decides the per-account status
//! that ends up in the snapshot. Cancellation is deliberately not a kind
//! here — it propagates as-is and is never classified.

use thiserror::Error;

/// Body markers that identify a Cloudflare anti-bot interstitial.
const CLOUDFLARE_MARKERS: &[&str] = &["just a moment", "checking your browser", "cf-ray"];

/// A classified upstream fetch failure.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request was cancelled by the governing deadline or shutdown.
    #[error("request cancelled")]
    Cancelled,

    /// 401/403, or locally-detectable credential problems.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// 429 (or 529) after the retry budget was exhausted.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// An anti-bot interstitial that no retry policy can get past.
    #[error("cloudflare challenge: {0}")]
    Cloudflare(String),

    /// Connection refused/reset, DNS failure, EOF, or I/O timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Any other 5xx.
    #[error("server error: {0}")]
    Server(String),

    /// The response parsed as something other than the expected schema.
    #[error("unexpected response schema: {0}")]
    Schema(String),
}

impl FetchError {
    /// Classify a non-success HTTP response by status code and body.
    ///
    /// 403 and 503 are checked for Cloudflare markers before falling into
    /// their plain auth/server buckets.
    #[must_use]
    pub fn from_response(status: u16, body: &str) -> Self {
        if (status == 403 || status == 503) && is_cloudflare_body(body) {
            return Self::Cloudflare(format!("HTTP {status}"));
        }
        match status {
            401 | 403 => Self::Auth(format!("HTTP {status}: {}", truncate(body, 200))),
            429 | 529 => Self::RateLimited(format!("HTTP {status}")),
            s if s >= 500 => Self::Server(format!("HTTP {s}: {}", truncate(body, 200))),
            s => Self::Server(format!("unexpected HTTP {s}: {}", truncate(body, 200))),
        }
    }

    /// Classify a reqwest transport-level error.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Network(err.to_string())
        } else if err.is_decode() {
            Self::Schema(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Check a response body for Cloudflare challenge markers.
#[must_use]
pub fn is_cloudflare_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    CLOUDFLARE_MARKERS.iter().any(|m| lower.contains(m))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

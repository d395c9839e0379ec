//! HTTP retry middleware for throttled upstreams.
//!
//! Wraps a `reqwest::Client` and transparently retries requests that come
//! back 429 or 529. Other statuses, 5xx included, pass through unchanged:
//! retrying non-idempotent methods is only safe for the server's own
//! throttle codes. When the retry budget runs out the final throttled
//! response is returned as a success — the caller owns that decision.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// HTTP statuses that the transport retries.
const THROTTLE_STATUSES: [u16; 2] = [429, 529];

/// Retry policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Additional attempts after the first send.
    pub max_retries: u32,
    /// Base for the exponential backoff schedule.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// Errors from the retry transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The governing deadline fired during a backoff sleep.
    #[error("request cancelled during retry backoff")]
    Cancelled,

    /// The request body is streaming and cannot be replayed across retries.
    #[error("request body cannot be buffered for retry")]
    UnreplayableBody,

    /// The underlying client failed to execute the request.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A `reqwest::Client` wrapper with bounded, jittered retries on throttling.
#[derive(Debug, Clone)]
pub struct RetryTransport {
    client: reqwest::Client,
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryTransport {
    /// Wrap `client` with the given retry policy and cancellation scope.
    #[must_use]
    pub fn new(client: reqwest::Client, config: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            config,
            cancel,
        }
    }

    /// The wrapped client, for requests that should bypass retry.
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute `request`, retrying 429/529 responses.
    ///
    /// The request body must already be buffered (anything built from
    /// bytes or JSON is); a streaming body fails fast with
    /// [`TransportError::UnreplayableBody`] so retries always replay
    /// bit-identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] if cancelled mid-backoff, or
    /// the underlying transport error. A throttled response that survives
    /// the whole retry budget is returned as `Ok`.
    pub async fn execute(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, TransportError> {
        // Probe replayability up front: one clone failure fails the call
        // before any bytes go out.
        if request.try_clone().is_none() {
            return Err(TransportError::UnreplayableBody);
        }

        let mut attempt: u32 = 0;
        loop {
            let this_try = request
                .try_clone()
                .ok_or(TransportError::UnreplayableBody)?;
            let response = self.client.execute(this_try).await?;
            let status = response.status().as_u16();

            if !THROTTLE_STATUSES.contains(&status) || attempt >= self.config.max_retries {
                return Ok(response);
            }

            let delay = self.delay_for(attempt, &response);
            tracing::debug!(
                status,
                attempt,
                delay_ms = delay.as_millis() as u64,
                url = %request.url(),
                "Throttled, backing off before retry"
            );

            // Drain and close the throttled body before sleeping
            let _ = response.bytes().await;

            tokio::select! {
                () = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// Pick the backoff delay for `attempt`, preferring the server's own
    /// `retry-after` seconds, with 0-25% uniform jitter on top.
    fn delay_for(&self, attempt: u32, response: &reqwest::Response) -> Duration {
        let base = retry_after_seconds(response)
            .map_or_else(|| self.config.base_delay * 2u32.saturating_pow(attempt), Duration::from_secs);
        apply_jitter(base)
    }
}

/// Parse an integer-seconds `retry-after` header, if present.
fn retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Scale `delay` by a uniform factor in [1.0, 1.25).
fn apply_jitter(delay: Duration) -> Duration {
    let factor: f64 = 1.0 + rand::rng().random_range(0.0..0.25);
    delay.mul_f64(factor)
}

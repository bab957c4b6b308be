//! Resilient outbound HTTP shared by all provider plugins.
//!
//! Retries cover connection failures and the gateway statuses 502/503/504,
//! never other 4xx. A provider 429 is translated, not retried, so the
//! caller's rate-limit surface can propagate Retry-After. Every attempt is
//! bounded by the remaining deadline, and backoff sleeps can never push past
//! it.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::ProviderError;

const BACKOFF_JITTER: f64 = 0.2;

/// Header names whose values must never reach a log line.
const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "x-api-key",
];

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub pool_max_idle: usize,
    pub pool_idle_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

pub struct ResilientClient {
    client: reqwest::Client,
    max_retries: u32,
    backoff_base: Duration,
}

impl ResilientClient {
    pub fn new(options: ClientOptions) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .pool_max_idle_per_host(options.pool_max_idle)
            .pool_idle_timeout(options.pool_idle_timeout)
            .user_agent(concat!("mindgate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_retries: options.max_retries,
            backoff_base: options.backoff_base,
        })
    }

    /// POST a JSON body and return the parsed JSON response, retrying within
    /// `budget`.
    pub async fn post_json(
        &self,
        url: &Url,
        headers: HeaderMap,
        body: &Value,
        budget: Duration,
    ) -> Result<Value, ProviderError> {
        let deadline = Instant::now() + budget;
        let mut last_error = ProviderError::Timeout;

        for attempt in 0..=self.max_retries {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProviderError::Timeout);
            }

            debug!(
                url = %url,
                attempt = attempt + 1,
                headers = ?redact_headers(&headers),
                "sending provider request"
            );

            let result = self
                .client
                .post(url.clone())
                .headers(headers.clone())
                .json(body)
                .timeout(remaining)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|_| ProviderError::InvalidResponse);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok());
                        return Err(ProviderError::RateLimited { retry_after });
                    }
                    if matches!(
                        status,
                        StatusCode::BAD_GATEWAY
                            | StatusCode::SERVICE_UNAVAILABLE
                            | StatusCode::GATEWAY_TIMEOUT
                    ) {
                        warn!(status = %status, attempt = attempt + 1, "provider returned gateway error");
                        last_error = ProviderError::Status {
                            status: status.as_u16(),
                        };
                    } else {
                        return Err(ProviderError::Status {
                            status: status.as_u16(),
                        });
                    }
                }
                Err(e) if e.is_timeout() => {
                    warn!(attempt = attempt + 1, "provider request timed out");
                    last_error = ProviderError::Timeout;
                }
                Err(e) if e.is_connect() || e.is_request() => {
                    warn!(attempt = attempt + 1, "provider connection failed: {e}");
                    last_error = ProviderError::Transport(e.to_string());
                }
                Err(e) => {
                    return Err(ProviderError::Transport(e.to_string()));
                }
            }

            if attempt < self.max_retries {
                let delay = backoff_delay(self.backoff_base, attempt)
                    .min(deadline.saturating_duration_since(Instant::now()));
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error)
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .finish()
    }
}

/// Exponential backoff with multiplicative jitter: `base * 2^attempt`,
/// scaled by a factor in `[1 - j, 1 + j]`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let nominal = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let factor = 1.0 + rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    Duration::from_secs_f64((nominal * factor).max(0.0))
}

/// A loggable view of a header map with secret values masked.
pub fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_str = name.as_str().to_ascii_lowercase();
            let shown = if REDACTED_HEADERS.contains(&name_str.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[binary]").to_string()
            };
            (name_str, shown)
        })
        .collect()
}

use crate::config::{RateLimitConfig, get_config};
use rand::Rng;
use ratelimit::Ratelimiter;
use std::time::Duration;

/// Per-adapter HTTP client: owns the token-bucket rate limiter (N per
/// {second,minute,hour,day}, 10% slack) and exponential-backoff-with-jitter
/// retries on transient/429/5xx responses (§4.A common contract). Grounded on
/// the single-window limiter in `debrid.rs`'s `Debrid::new`/`wait`, generalised
/// to four windows.
pub struct DebridHttpClient {
    pub client: reqwest::Client,
    limiters: Vec<Ratelimiter>,
    max_retries: u32,
}

impl DebridHttpClient {
    pub fn new(rate_limit: &RateLimitConfig) -> anyhow::Result<Self> {
        let config = get_config();
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.http_timeout_secs));
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(&proxy.url)?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build()?;

        let windows = [
            (rate_limit.per_second, Duration::from_secs(1)),
            (rate_limit.per_minute, Duration::from_secs(60)),
            (rate_limit.per_hour, Duration::from_secs(3600)),
            (rate_limit.per_day, Duration::from_secs(86400)),
        ];

        let mut limiters = Vec::new();
        for (quota, interval) in windows {
            if quota == 0 {
                continue;
            }
            // 10% slack per §4.A.
            let quota_with_slack = ((quota as f64) * 1.1).ceil() as u32;
            let limiter = Ratelimiter::builder(quota_with_slack.max(1), interval)
                .max_tokens(quota_with_slack.max(1))
                .build()?;
            limiters.push(limiter);
        }

        Ok(Self {
            client,
            limiters,
            max_retries: config.max_retries,
        })
    }

    /// Unrated, zero-retry client for adapter tests, which mock the transport
    /// and don't go through `load_config`.
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            client: reqwest::Client::new(),
            limiters: Vec::new(),
            max_retries: 0,
        }
    }

    async fn wait_for_slot(&self) {
        loop {
            let mut blocked_for = None;
            for limiter in &self.limiters {
                if let Err(sleep_for) = limiter.try_wait() {
                    blocked_for = Some(blocked_for.map_or(sleep_for, |cur: Duration| cur.max(sleep_for)));
                }
            }

            match blocked_for {
                Some(duration) => tokio::time::sleep(duration).await,
                None => break,
            }
        }
    }

    /// Sends a request, retrying transient/429/5xx failures with exponential
    /// backoff + jitter up to `max_retries` (§4.A, §7).
    pub async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> anyhow::Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            self.wait_for_slot().await;
            let result = build().send().await;
            match result {
                Ok(response) if response.status().is_server_error() || response.status().as_u16() == 429 => {
                    if attempt >= self.max_retries {
                        return Ok(response);
                    }
                }
                Ok(response) => return Ok(response),
                Err(e) if !e.is_timeout() && !e.is_connect() => return Err(e.into()),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(e.into());
                    }
                }
            }

            let backoff = Duration::from_millis(250 * 2u64.pow(attempt)) + jitter();
            tracing::debug!("retrying request (attempt {}) after {:?}", attempt + 1, backoff);
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn jitter() -> Duration {
    let ms = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(ms)
}

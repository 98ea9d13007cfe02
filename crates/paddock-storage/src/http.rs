use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// 5xx and 429 are worth another request; every other failure status is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Doubling delay with a ceiling. Drives HTTP retries and whole-date retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|shift| 2u32.checked_pow(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests allowed in flight at once across all sources.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
    /// Requests spent on this fetch, retries included.
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

/// One request's result: the payload, or an error flagged retryable or not.
enum Attempt {
    Done(String, Vec<u8>),
    Failed { error: FetchError, transient: bool },
}

/// Fetcher whose concurrency and retry budget come from the caller's
/// configuration; nothing here is process-wide.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let mut retry = 0;
        loop {
            let attempts = retry + 1;
            match self.attempt(url, attempts).await {
                Attempt::Done(final_url, body) => {
                    return Ok(FetchedResponse {
                        final_url,
                        body,
                        attempts,
                    })
                }
                Attempt::Failed { error, transient } if transient && retry < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(retry);
                    debug!(%error, attempts, ?delay, "transient fetch failure; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Attempt::Failed { error, .. } => return Err(error),
            }
        }
    }

    async fn attempt(&self, url: &str, attempts: usize) -> Attempt {
        let failed = |source: reqwest::Error| Attempt::Failed {
            transient: is_transient_error(&source),
            error: FetchError::Request {
                url: url.to_string(),
                attempts,
                source,
            },
        };

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(source) => return failed(source),
        };
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Attempt::Failed {
                transient: is_transient_status(status),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    attempts,
                },
            };
        }
        match response.bytes().await {
            Ok(body) => Attempt::Done(final_url, body.to_vec()),
            Err(source) => failed(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_the_retry_budget() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(500),
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..Default::default()
        })
        .unwrap();

        let err = fetcher
            .fetch_bytes(Uuid::new_v4(), "results", "http://127.0.0.1:9/day.json")
            .await
            .unwrap_err();
        match err {
            FetchError::Request { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error {other}"),
        }
    }
}

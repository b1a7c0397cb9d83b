//! Resilient HTTP client core: one connection pool per base URL, a circuit
//! breaker per client instance, and retry with exponential backoff.
//!
//! Classification rules: 5xx, transport errors, and timeouts are retryable
//! and feed the breaker (one breaker failure per exhausted call); 4xx is a
//! caller error that propagates immediately and resets the breaker; 404 is a
//! successful "not found" and returns empty data.

use anyhow::Result;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("circuit breaker open, request rejected")]
    BreakerOpen,
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("client error {status} from {url}: {body}")]
    Client { status: u16, url: String, body: String },
    #[error("{url} still failing ({last_status:?}) after {attempts} attempts")]
    Exhausted {
        url: String,
        attempts: u32,
        last_status: Option<u16>,
    },
}

impl HttpError {
    /// Whether this error may succeed on a later retry of the whole call.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Client { .. })
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    open_until: Option<Instant>,
}

/// Mutex-guarded breaker state on a monotonic clock.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a request may go out. An expired open window resets the
    /// breaker and lets the next request probe the backend.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.open_until {
            None => true,
            Some(until) if Instant::now() > until => {
                state.open_until = None;
                state.failure_count = 0;
                tracing::info!("Circuit breaker reset - attempting request");
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.failure_count = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.failure_count += 1;
        if state.failure_count >= self.threshold {
            state.open_until = Some(Instant::now() + self.timeout);
            tracing::warn!(
                "Circuit breaker opened after {} failures",
                state.failure_count
            );
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .open_until
            .map(|until| Instant::now() <= until)
            .unwrap_or(false)
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct HttpClient {
    base_url: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    max_attempts: u32,
    /// Base for the exponential backoff between attempts (2 s in
    /// production; tests shrink it).
    retry_base: Duration,
}

impl HttpClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        breaker_threshold: u32,
        breaker_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        tracing::info!("HTTP client initialized for {}", base_url);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            breaker: CircuitBreaker::new(breaker_threshold, breaker_timeout),
            max_attempts: 3,
            retry_base: Duration::from_secs(2),
        })
    }

    /// Shrink the retry backoff; test hook.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// GET a JSON document. `Ok(None)` means 404.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<Value>, HttpError> {
        let url = format!("{}{}", self.base_url, path);
        self.execute(|| self.client.get(&url).query(query), &url)
            .await
    }

    /// POST a JSON body and parse the JSON reply. `Ok(None)` means 404.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Option<Value>, HttpError> {
        let url = format!("{}{}", self.base_url, path);
        self.execute(|| self.client.post(&url).json(body), &url)
            .await
    }

    async fn execute<F>(&self, build: F, url: &str) -> Result<Option<Value>, HttpError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        if !self.breaker.can_execute() {
            tracing::warn!("Circuit breaker is open - request to {} rejected", url);
            return Err(HttpError::BreakerOpen);
        }

        let mut last_status: Option<u16> = None;
        let mut last_error: Option<HttpError> = None;

        for attempt in 1..=self.max_attempts {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.breaker.record_success();
                        let value = response.json::<Value>().await.map_err(|e| {
                            HttpError::Transport {
                                url: url.to_string(),
                                message: format!("invalid JSON body: {}", e),
                            }
                        })?;
                        return Ok(Some(value));
                    }
                    if status.as_u16() == 404 {
                        // Not found is an answer, not a service failure.
                        self.breaker.record_success();
                        return Ok(None);
                    }
                    if status.is_client_error() {
                        self.breaker.record_success();
                        let body = response.text().await.unwrap_or_default();
                        return Err(HttpError::Client {
                            status: status.as_u16(),
                            url: url.to_string(),
                            body: body.chars().take(200).collect(),
                        });
                    }

                    tracing::warn!(
                        "{} returned {} on attempt {}/{}",
                        url,
                        status,
                        attempt,
                        self.max_attempts
                    );
                    last_status = Some(status.as_u16());
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!("Request to {} timed out (attempt {})", url, attempt);
                    last_error = Some(HttpError::Timeout {
                        url: url.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Transport error for {} (attempt {}): {}", url, attempt, e);
                    last_error = Some(HttpError::Transport {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                }
            }

            if attempt < self.max_attempts {
                // Exponential backoff: base, 2×base, 4×base.
                let delay = self.retry_base * (1 << (attempt - 1));
                tracing::info!("Retrying {} in {:?}", url, delay);
                tokio::time::sleep(delay).await;
            }
        }

        // The whole call failed; one breaker failure regardless of how many
        // attempts burned.
        self.breaker.record_failure();
        Err(last_error.unwrap_or(HttpError::Exhausted {
            url: url.to_string(),
            attempts: self.max_attempts,
            last_status,
        }))
    }
}

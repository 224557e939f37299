//! JSON-over-HTTP client with retry classification and capped exponential backoff.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// Whether a failed call is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    fn from_bool(retry: bool) -> Self {
        if retry {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Throttling and server faults are transient; other statuses are final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    RetryDisposition::from_bool(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error())
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    RetryDisposition::from_bool(err.is_connect() || err.is_timeout() || err.is_request())
}

/// Doubling delay per attempt, clamped to `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub retries: usize,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.ceiling)
    }

    /// Retries allowed for `method`. Non-idempotent calls are never replayed
    /// because a repeated create could write the same batch twice.
    pub fn budget_for(&self, method: &Method) -> usize {
        if method.is_idempotent() {
            self.retries
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} answered {status}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("{url} returned malformed JSON: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub final_url: String,
    /// `None` for empty bodies (e.g. 204 No Content).
    pub body: Option<JsonValue>,
}

/// One JSON call: method, target and optional query and body.
struct Call<'a> {
    method: Method,
    url: &'a str,
    query: &'a [(&'a str, String)],
    body: Option<&'a JsonValue>,
}

enum Attempt {
    Done(JsonResponse),
    Retry(FetchError),
    Fail(FetchError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        let builder = match &config.user_agent {
            Some(agent) => builder.user_agent(agent.as_str()),
            None => builder,
        };
        let client = builder.build().context("constructing HTTP client")?;
        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonResponse, FetchError> {
        self.call(Call {
            method: Method::GET,
            url,
            query,
            body: None,
        })
        .await
    }

    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonResponse, FetchError> {
        self.call(Call {
            method,
            url,
            query: &[],
            body: Some(body),
        })
        .await
    }

    fn build(&self, call: &Call<'_>) -> RequestBuilder {
        let mut request = self
            .client
            .request(call.method.clone(), call.url)
            .header(reqwest::header::ACCEPT, "application/json");
        if !call.query.is_empty() {
            request = request.query(call.query);
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = call.body {
            request = request.json(body);
        }
        request
    }

    async fn call(&self, call: Call<'_>) -> Result<JsonResponse, FetchError> {
        let span = info_span!("http_call", method = %call.method, url = call.url);
        async {
            let budget = self.backoff.budget_for(&call.method);
            let mut attempt = 0;
            loop {
                match self.attempt(&call).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Retry(err) if attempt < budget => {
                        debug!(attempt, error = %err, "retrying");
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                        attempt += 1;
                    }
                    Attempt::Retry(err) | Attempt::Fail(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, call: &Call<'_>) -> Attempt {
        let response = match self.build(call).send().await {
            Ok(response) => response,
            Err(err) if classify_transport_error(&err) == RetryDisposition::Retryable => {
                return Attempt::Retry(err.into())
            }
            Err(err) => return Attempt::Fail(err.into()),
        };

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let err = FetchError::Status {
                status: status.as_u16(),
                url: final_url,
                body: response.text().await.unwrap_or_default(),
            };
            return match classify_status(status) {
                RetryDisposition::Retryable => Attempt::Retry(err),
                RetryDisposition::NonRetryable => Attempt::Fail(err),
            };
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return Attempt::Fail(err.into()),
        };
        if bytes.is_empty() {
            return Attempt::Done(JsonResponse {
                status,
                final_url,
                body: None,
            });
        }
        match serde_json::from_slice(&bytes) {
            Ok(body) => Attempt::Done(JsonResponse {
                status,
                final_url,
                body: Some(body),
            }),
            Err(source) => Attempt::Fail(FetchError::Json { url: final_url, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            retries: 5,
            initial: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn only_idempotent_methods_get_retries() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.budget_for(&Method::GET), 3);
        assert_eq!(policy.budget_for(&Method::PUT), 3);
        assert_eq!(policy.budget_for(&Method::POST), 0);
        assert_eq!(policy.budget_for(&Method::PATCH), 0);
    }

    #[test]
    fn client_builds_with_token_and_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("pdir-test/0.1".into()),
            bearer_token: Some("secret".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}

use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::Instrument;

use crate::telemetry::metrics::{
    UPSTREAM_CALL_DURATION, UPSTREAM_ERROR_COUNT, UPSTREAM_RETRY_COUNT,
};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("upstream returned {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl UpstreamError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else {
            UpstreamError::Network(err.to_string())
        }
    }

    /// Failure reason as shown next to a failed call. Backend-supplied reasons are kept verbatim.
    pub fn reason(&self) -> String {
        match self {
            UpstreamError::Status { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Network(_) | UpstreamError::Timeout => true,
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::Decode(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Network(_) => "network_error",
            UpstreamError::Timeout => "timeout",
            UpstreamError::Status { status: 429, .. } => "rate_limit",
            UpstreamError::Status { status, .. } if *status >= 500 => "server_error",
            UpstreamError::Status { .. } => "client_error",
            UpstreamError::Decode(_) => "decode_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub user_agent: String,
}

/// Shared HTTP client for every upstream call: one span, metrics and bounded
/// retries per logical call.
pub struct UpstreamClient {
    http: reqwest::Client,
    max_attempts: u32,
}

impl UpstreamClient {
    pub fn new(options: &UpstreamOptions) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .user_agent(options.user_agent.as_str())
            .timeout(options.timeout)
            .build()
            .map_err(UpstreamError::from_reqwest)?;

        Ok(Self {
            http,
            max_attempts: options.max_attempts.max(1),
        })
    }

    pub async fn post_json<B, R>(&self, name: &str, url: &str, body: &B) -> Result<R, UpstreamError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.execute(name, "POST", url, || self.http.post(url).json(body))
            .await
    }

    /// `url` must not carry credentials; pass them through `query` so they stay out of spans.
    pub async fn get_json<R>(
        &self,
        name: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<R, UpstreamError>
    where
        R: DeserializeOwned,
    {
        self.execute(name, "GET", url, || self.http.get(url).query(query))
            .await
    }

    async fn execute<R, F>(
        &self,
        name: &str,
        method: &str,
        url: &str,
        build: F,
    ) -> Result<R, UpstreamError>
    where
        R: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.send_once(name, method, url, build()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(
                        upstream = name,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Upstream call failed, retrying"
                    );

                    UPSTREAM_RETRY_COUNT.add(1, &[KeyValue::new("upstream.name", name.to_string())]);

                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<R>(
        &self,
        name: &str,
        method: &str,
        url: &str,
        request: RequestBuilder,
    ) -> Result<R, UpstreamError>
    where
        R: DeserializeOwned,
    {
        let start = Instant::now();

        let span = tracing::info_span!(
            "upstream.call",
            otel.name = %format!("{method} {name}"),
            upstream.name = %name,
            http.request.method = %method,
            url.full = %url,
            http.response.status_code = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
            error.type = tracing::field::Empty,
        );

        let result = async {
            let response = request.send().await.map_err(UpstreamError::from_reqwest)?;
            let status = response.status();
            tracing::Span::current().record("http.response.status_code", status.as_u16() as i64);

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamError::Status {
                    status: status.as_u16(),
                    reason: error_reason(status, &body),
                });
            }

            response.json::<R>().await.map_err(UpstreamError::from_reqwest)
        }
        .instrument(span.clone())
        .await;

        let duration = start.elapsed().as_secs_f64();
        let name_kv = KeyValue::new("upstream.name", name.to_string());

        match &result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
                UPSTREAM_CALL_DURATION.record(
                    duration,
                    &[name_kv, KeyValue::new("upstream.outcome", "success")],
                );
            }
            Err(err) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.type", err.kind());
                UPSTREAM_CALL_DURATION.record(
                    duration,
                    &[name_kv.clone(), KeyValue::new("upstream.outcome", "error")],
                );
                UPSTREAM_ERROR_COUNT.add(1, &[name_kv, KeyValue::new("error.type", err.kind())]);
            }
        }

        result
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Longest wait between two attempts: the backoff cap plus full jitter.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(6_250);

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(500) * 2u32.pow(attempt.saturating_sub(1).min(4));
    let base = base.min(MAX_BACKOFF);
    // 25% jitter
    let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter_ms)
}

fn error_reason(status: StatusCode, body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.error.trim().is_empty() => parsed.error,
        _ => status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
    }
}

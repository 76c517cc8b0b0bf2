use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client as HttpClient, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ClientOptions;
use crate::event::{LIB_NAME, LIB_VERSION};
use crate::Error;

/// Resilient JSON POST. Owns the HTTP client, the retry budget, and the
/// backoff state machine; knows nothing about events or flags.
pub struct Transport {
    client: HttpClient,
    compress: bool,
    max_retries: u32,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
}

impl Transport {
    pub fn new(options: &ClientOptions) -> Self {
        let client = HttpClient::builder()
            .timeout(options.request_timeout)
            .user_agent(user_agent())
            .build()
            .unwrap(); // Unwrap here is as safe as `HttpClient::new`

        Self {
            client,
            compress: options.enable_compression,
            max_retries: options.max_retries,
            initial_retry_delay: options.initial_retry_delay,
            max_retry_delay: options.max_retry_delay,
        }
    }

    /// POST `payload` as JSON and decode the 2xx response body as `R`.
    ///
    /// Retries on network errors and on 408/429/5xx, waiting between
    /// attempts per `Retry-After` when the server sent one and the capped
    /// exponential backoff otherwise. Every other status maps to an error
    /// immediately. At most `1 + max_retries` requests go out.
    pub async fn post_json<P, R>(
        &self,
        url: &str,
        payload: &P,
        cancel: &CancellationToken,
    ) -> Result<R, Error>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let encoded = serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))?;
        let (body, content_encoding) = if self.compress {
            (gzip_body(&encoded)?, Some("gzip"))
        } else {
            (encoded, None)
        };

        let mut backoff = self.initial_retry_delay;
        let mut attempt: u32 = 0;

        // Every arm below either returns or falls through to exactly one
        // schedule-next-attempt tail; there is no third path out of the loop.
        loop {
            attempt += 1;

            let mut request = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
            if let Some(encoding) = content_encoding {
                request = request.header(CONTENT_ENCODING, encoding);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = request.send() => outcome,
            };

            let retry_after = match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<R>()
                            .await
                            .map_err(|e| Error::Serialization(e.to_string()));
                    }
                    if status == StatusCode::NOT_FOUND {
                        // Usually a mistyped host, not an API-level failure.
                        return Err(Error::NotFound(url.to_string()));
                    }
                    if !is_retryable_status(status) {
                        return Err(read_error_body(status, response).await);
                    }
                    if attempt > self.max_retries {
                        debug!(%status, attempt, "retry budget exhausted");
                        return Err(Error::Connection(format!(
                            "giving up after {} attempts, last status {}",
                            attempt, status
                        )));
                    }
                    let header = retry_after_header(response.headers());
                    // Drain the body so the connection is released before waiting.
                    let _ = response.bytes().await;
                    header.map(|value| retry_after_delay(&value, Utc::now()))
                }
                Err(err) => {
                    if attempt > self.max_retries {
                        return Err(Error::Connection(err.to_string()));
                    }
                    trace!(error = %err, attempt, "request failed, will retry");
                    None
                }
            };

            let delay = retry_after
                .flatten()
                .unwrap_or(backoff)
                .min(self.max_retry_delay);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before retry");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = next_retry_delay(backoff, self.max_retry_delay);
        }
    }

    /// One-shot authorized GET, used for flag-definition and remote-config
    /// reads. No retry loop; the pollers carry their own cadence.
    pub async fn get_json<R>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<R, Error>
    where
        R: DeserializeOwned,
    {
        let mut request = self.client.get(url);
        if let Some(token) = bearer_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = request.send() => outcome,
        };
        let response = outcome.map_err(|e| Error::Connection(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(read_error_body(status, response).await);
        }
        response
            .json::<R>()
            .await
            .map_err(|e| Error::Serialization(e.to_string()))
    }

}

pub(crate) fn user_agent() -> String {
    format!(
        "{}/{} (rust; {}; {})",
        LIB_NAME,
        LIB_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

async fn read_error_body(status: StatusCode, response: reqwest::Response) -> Error {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Error::from_status(status, body)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn retry_after_header(headers: &HeaderMap) -> Option<HeaderValue> {
    headers.get(RETRY_AFTER).cloned()
}

/// Resolves a `Retry-After` header into a wait. Delta-seconds and HTTP-date
/// forms are both accepted; deadlines already in the past clamp to zero.
pub(crate) fn retry_after_delay(value: &HeaderValue, now: DateTime<Utc>) -> Option<Duration> {
    let text = value.to_str().ok()?.trim();

    if let Ok(seconds) = text.parse::<i64>() {
        return Some(Duration::from_secs(seconds.max(0) as u64));
    }

    let date = DateTime::parse_from_rfc2822(text).ok()?;
    let remaining = date.with_timezone(&Utc) - now;
    match remaining.to_std() {
        Ok(wait) => Some(wait),
        Err(_) => Some(Duration::ZERO),
    }
}

/// Doubles the backoff without ever overflowing past `max`: once the current
/// value crosses half of `max`, the next value is pinned to `max` exactly.
pub(crate) fn next_retry_delay(current: Duration, max: Duration) -> Duration {
    if current >= max || current > max / 2 {
        max
    } else {
        current * 2
    }
}

fn gzip_body(body: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map_err(|e| {
            warn!(error = %e, "gzip compression failed");
            Error::Serialization(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn backoff_doubles_then_pins_to_max() {
        let max = Duration::from_secs(30);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay);
            delay = next_retry_delay(delay, max);
        }
        // Non-decreasing, capped, and stable at the cap.
        for pair in seen.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[4], Duration::from_secs(16));
        assert_eq!(seen[5], max); // 16 > 30/2, so pinned rather than 32
        assert_eq!(seen[7], max);
    }

    #[test]
    fn backoff_never_overflows() {
        let max = Duration::from_secs(30);
        assert_eq!(next_retry_delay(Duration::MAX, max), max);
        assert_eq!(next_retry_delay(max, max), max);
        assert_eq!(next_retry_delay(max * 2, max), max);
    }

    #[test]
    fn retry_after_delta_seconds() {
        let value = HeaderValue::from_static("7");
        assert_eq!(
            retry_after_delay(&value, Utc::now()),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn retry_after_negative_clamps_to_zero() {
        let value = HeaderValue::from_static("-3");
        assert_eq!(retry_after_delay(&value, Utc::now()), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_http_date() {
        let now: DateTime<Utc> = "2024-06-15T10:30:00Z".parse().unwrap();
        let value = HeaderValue::from_static("Sat, 15 Jun 2024 10:30:10 GMT");
        assert_eq!(
            retry_after_delay(&value, now),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn retry_after_date_in_past_is_zero() {
        let now: DateTime<Utc> = "2024-06-15T10:30:00Z".parse().unwrap();
        let value = HeaderValue::from_static("Sat, 15 Jun 2024 10:29:59 GMT");
        assert_eq!(retry_after_delay(&value, now), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_garbage_is_ignored() {
        let value = HeaderValue::from_static("soon");
        assert_eq!(retry_after_delay(&value, Utc::now()), None);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn gzip_round_trips() {
        let payload = br#"{"api_key":"phc_test","batch":[]}"#;
        let compressed = gzip_body(payload).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut restored = Vec::new();
        decoder.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn user_agent_shape() {
        let agent = user_agent();
        assert!(agent.starts_with(&format!("{}/{} (rust; ", LIB_NAME, LIB_VERSION)));
        assert!(agent.ends_with(')'));
    }
}

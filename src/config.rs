use std::collections::HashMap;
use std::time::Duration;

use crate::Error;

/// Configuration options for the PostHog client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub(crate) api_key: String,
    pub(crate) host: Option<String>,
    pub(crate) personal_api_key: Option<String>,
    pub(crate) flush_at: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) max_batch_size: usize,
    pub(crate) max_queue_size: usize,
    pub(crate) max_retries: u32,
    pub(crate) initial_retry_delay: Duration,
    pub(crate) max_retry_delay: Duration,
    pub(crate) enable_compression: bool,
    pub(crate) flag_poll_interval: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) super_properties: HashMap<String, serde_json::Value>,
    pub(crate) disabled: bool,
}

impl ClientOptions {
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn personal_api_key(&self) -> Option<&str> {
        self.personal_api_key.as_deref()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

/// Builder for [`ClientOptions`] with validation.
pub struct ClientOptionsBuilder {
    api_key: Option<String>,
    host: Option<String>,
    personal_api_key: Option<String>,
    flush_at: usize,
    flush_interval: Duration,
    max_batch_size: usize,
    max_queue_size: usize,
    max_retries: u32,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    enable_compression: bool,
    flag_poll_interval: Duration,
    request_timeout: Duration,
    super_properties: HashMap<String, serde_json::Value>,
    disabled: bool,
}

impl ClientOptionsBuilder {
    pub fn new() -> Self {
        Self {
            api_key: None,
            host: None,
            personal_api_key: None,
            flush_at: 20,
            flush_interval: Duration::from_secs(30),
            max_batch_size: 100,
            max_queue_size: 1000,
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            enable_compression: false,
            flag_poll_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            super_properties: HashMap::new(),
            disabled: false,
        }
    }

    /// Set the project API key (required). Authenticates event ingestion.
    pub fn api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the API host. Accepts either a hostname like
    /// "https://eu.posthog.com" or a full endpoint URL like
    /// "https://us.i.posthog.com/batch/" (the path is stripped).
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the personal API key. Enables flag-definition polling, local
    /// evaluation, and remote-config reads.
    pub fn personal_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.personal_api_key = Some(key.into());
        self
    }

    /// Queue depth that triggers a flush (default: 20)
    pub fn flush_at(mut self, flush_at: usize) -> Self {
        self.flush_at = flush_at;
        self
    }

    /// Cadence of the periodic flush (default: 30s)
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Maximum events per batch request (default: 100)
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Bounded queue capacity; the oldest events are dropped beyond it
    /// (default: 1000)
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Retry attempts after the first failure (default: 3)
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// First backoff wait (default: 1s)
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Cap for any retry wait (default: 30s)
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Gzip request bodies (default: false)
    pub fn enable_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    /// Cadence of flag-definition polling (default: 30s)
    pub fn flag_poll_interval(mut self, interval: Duration) -> Self {
        self.flag_poll_interval = interval;
        self
    }

    /// Per-request HTTP timeout (default: 30s)
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Properties merged into every captured event. Event-level properties
    /// win on key collisions.
    pub fn super_properties(mut self, props: HashMap<String, serde_json::Value>) -> Self {
        self.super_properties = props;
        self
    }

    /// Disable the client entirely; capture calls become no-ops.
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Build the [`ClientOptions`], validating all fields.
    pub fn build(self) -> Result<ClientOptions, Error> {
        let api_key = self
            .api_key
            .ok_or_else(|| Error::Configuration("api_key is required".to_string()))?;

        if api_key.is_empty() {
            return Err(Error::Configuration("api_key must not be empty".to_string()));
        }
        if self.flush_at == 0 {
            return Err(Error::Configuration("flush_at must be positive".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Configuration(
                "max_batch_size must be positive".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Configuration(
                "max_queue_size must be positive".to_string(),
            ));
        }
        if self.flush_interval.is_zero() || self.flag_poll_interval.is_zero() {
            return Err(Error::Configuration(
                "flush_interval and flag_poll_interval must be positive".to_string(),
            ));
        }

        // Reject a bad host now rather than at first send.
        if let Some(ref host) = self.host {
            crate::endpoints::normalize_endpoint(host)?;
        }

        Ok(ClientOptions {
            api_key,
            host: self.host,
            personal_api_key: self.personal_api_key,
            flush_at: self.flush_at,
            flush_interval: self.flush_interval,
            max_batch_size: self.max_batch_size,
            max_queue_size: self.max_queue_size,
            max_retries: self.max_retries,
            initial_retry_delay: self.initial_retry_delay,
            max_retry_delay: self.max_retry_delay,
            enable_compression: self.enable_compression,
            flag_poll_interval: self.flag_poll_interval,
            request_timeout: self.request_timeout,
            super_properties: self.super_properties,
            disabled: self.disabled,
        })
    }
}

impl Default for ClientOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ClientOptions {
    fn from(api_key: &str) -> Self {
        ClientOptionsBuilder::default()
            .api_key(api_key)
            .build()
            .expect("We always set the API key, so this is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = ClientOptions::from("phc_test");
        assert_eq!(options.flush_at, 20);
        assert_eq!(options.flush_interval, Duration::from_secs(30));
        assert_eq!(options.max_batch_size, 100);
        assert_eq!(options.max_queue_size, 1000);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.initial_retry_delay, Duration::from_secs(1));
        assert_eq!(options.max_retry_delay, Duration::from_secs(30));
        assert!(!options.enable_compression);
        assert_eq!(options.flag_poll_interval, Duration::from_secs(30));
        assert!(options.personal_api_key.is_none());
        assert!(options.super_properties.is_empty());
        assert!(!options.is_disabled());
    }

    #[test]
    fn api_key_is_required() {
        let err = ClientOptionsBuilder::new().build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_zero_sizes() {
        let err = ClientOptionsBuilder::new()
            .api_key("phc_test")
            .max_queue_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = ClientOptionsBuilder::new()
            .api_key("phc_test")
            .flush_at(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_invalid_host() {
        let err = ClientOptionsBuilder::new()
            .api_key("phc_test")
            .host("not-a-url")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}

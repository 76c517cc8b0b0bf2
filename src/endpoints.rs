use crate::Error;
use std::fmt;

/// US ingestion endpoint
pub const US_INGESTION_ENDPOINT: &str = "https://us.i.posthog.com";

/// EU ingestion endpoint
pub const EU_INGESTION_ENDPOINT: &str = "https://eu.i.posthog.com";

/// Default host (US by default)
pub const DEFAULT_HOST: &str = US_INGESTION_ENDPOINT;

/// API endpoints for different operations
#[derive(Debug, Clone, Copy)]
pub enum Endpoint {
    /// Single-event capture (identify, alias, group identify)
    Capture,
    /// Batched event capture
    Batch,
    /// Remote feature-flag decisions
    Decide,
}

impl Endpoint {
    /// Get the path for this endpoint
    pub fn path(&self) -> &str {
        match self {
            Endpoint::Capture => "/capture/",
            Endpoint::Batch => "/batch/",
            Endpoint::Decide => "/decide/?v=3",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Normalize an endpoint to a base URL.
/// Accepts both hostnames (https://us.posthog.com) and full endpoints
/// (https://us.i.posthog.com/batch/).
pub fn normalize_endpoint(endpoint: &str) -> Result<String, Error> {
    let endpoint = endpoint.trim();

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(Error::Configuration(
            "endpoint must start with http:// or https://".to_string(),
        ));
    }

    let url = endpoint
        .parse::<url::Url>()
        .map_err(|e| Error::Configuration(format!("invalid URL: {}", e)))?;

    let scheme = url.scheme();
    let host = url
        .host_str()
        .ok_or_else(|| Error::Configuration("missing host".to_string()))?;

    // Strip any endpoint path; only scheme://host:port is kept.
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    Ok(format!("{}://{}{}", scheme, host, port))
}

/// Manages PostHog API endpoints and host configuration
#[derive(Debug, Clone)]
pub struct EndpointManager {
    base_host: String,
}

impl EndpointManager {
    /// Create a new endpoint manager with the given host
    pub fn new(host: Option<String>) -> Self {
        let normalized_host = host.and_then(|h| normalize_endpoint(&h).ok());
        let base_host = Self::determine_server_host(normalized_host);
        Self { base_host }
    }

    /// Determine the actual server host based on the provided host
    pub fn determine_server_host(host: Option<String>) -> String {
        let host_or_default = host.unwrap_or_else(|| DEFAULT_HOST.to_string());
        let trimmed_host = host_or_default.trim_end_matches('/');

        match trimmed_host {
            "https://app.posthog.com" | "https://us.posthog.com" => {
                US_INGESTION_ENDPOINT.to_string()
            }
            "https://eu.posthog.com" => EU_INGESTION_ENDPOINT.to_string(),
            _ => host_or_default,
        }
    }

    /// Get the base host URL (for constructing endpoints)
    pub fn base_host(&self) -> &str {
        &self.base_host
    }

    /// Build a full URL for a given endpoint
    pub fn build_url(&self, endpoint: Endpoint) -> String {
        format!(
            "{}{}",
            self.base_host.trim_end_matches('/'),
            endpoint.path()
        )
    }

    /// Build the flag-definition URL with the project token
    pub fn build_local_eval_url(&self, token: &str) -> String {
        format!(
            "{}/api/feature_flag/local_evaluation/?token={}&send_cohorts",
            self.base_host.trim_end_matches('/'),
            token
        )
    }

    /// Build the remote-config payload URL for a flag key
    pub fn build_remote_config_url(&self, key: &str) -> String {
        format!(
            "{}/api/projects/@current/feature_flags/{}/remote_config/",
            self.base_host.trim_end_matches('/'),
            key
        )
    }
}

impl Default for EndpointManager {
    fn default() -> Self {
        Self::new(None)
    }
}

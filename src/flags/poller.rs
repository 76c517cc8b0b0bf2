use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::flags::types::{FlagSnapshot, LocalEvaluationResponse};
use crate::transport::user_agent;

/// Holder for the current [`FlagSnapshot`]. The poller swaps a freshly
/// built snapshot in with a single reference assignment; readers clone the
/// `Arc` once and evaluate against a consistent view.
pub struct SnapshotStore {
    current: RwLock<Arc<FlagSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(FlagSnapshot::default())),
        }
    }

    pub fn swap(&self, snapshot: FlagSnapshot) {
        *self.current.write().unwrap() = Arc::new(snapshot);
    }

    pub fn load(&self) -> Arc<FlagSnapshot> {
        self.current.read().unwrap().clone()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for flag-definition fetching.
#[derive(Debug, Clone)]
pub struct FlagSourceConfig {
    /// Personal API key; the definition endpoint rejects project tokens.
    pub personal_api_key: String,
    /// Full URL of the definition endpoint (token query included).
    pub url: String,
    pub request_timeout: Duration,
}

/// Result of one conditional fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// A new snapshot was published; carries the ETag to revalidate with.
    Updated(Option<String>),
    /// 304: the current snapshot is still fresh.
    NotModified,
    /// Network or server failure; the current snapshot stays in place.
    Failed,
}

/// Performs single conditional fetches of the flag-definition document.
/// The polling cadence lives in [`FlagPoller`]; keeping the fetch separate
/// makes the revalidation contract directly exercisable.
pub struct FlagDefinitionSource {
    client: reqwest::Client,
    config: FlagSourceConfig,
}

impl FlagDefinitionSource {
    pub fn new(config: FlagSourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(user_agent())
            .build()
            .unwrap(); // Unwrap here is as safe as `Client::new`
        Self { client, config }
    }

    /// Fetch the definition document, revalidating with `If-None-Match`
    /// when an ETag is known. On 2xx the parsed snapshot is swapped into
    /// `store`; every other outcome leaves the store untouched.
    pub async fn fetch(&self, store: &SnapshotStore, etag: Option<&str>) -> FetchOutcome {
        let mut request = self.client.get(&self.config.url).header(
            AUTHORIZATION,
            format!("Bearer {}", self.config.personal_api_key),
        );
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to fetch flag definitions");
                return FetchOutcome::Failed;
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            trace!("flag definitions not modified");
            return FetchOutcome::NotModified;
        }
        if status == StatusCode::UNAUTHORIZED {
            error!("flag definition endpoint rejected the personal API key");
            return FetchOutcome::Failed;
        }
        if !status.is_success() {
            warn!(status = %status, "failed to fetch flag definitions");
            return FetchOutcome::Failed;
        }

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(String::from);

        match response.json::<LocalEvaluationResponse>().await {
            Ok(document) => {
                let flag_count = document.flags.len();
                store.swap(FlagSnapshot::from_response(document, new_etag.clone()));
                debug!(flag_count, "flag snapshot updated");
                FetchOutcome::Updated(new_etag)
            }
            Err(e) => {
                warn!(error = %e, "failed to parse flag definition response");
                FetchOutcome::Failed
            }
        }
    }
}

/// Background task that keeps the snapshot fresh. Fetch failures are
/// logged and absorbed; user-facing calls degrade to remote evaluation
/// until the next successful poll.
pub struct FlagPoller {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FlagPoller {
    pub fn start(
        source: FlagDefinitionSource,
        store: Arc<SnapshotStore>,
        poll_interval: Duration,
    ) -> Self {
        info!(
            poll_interval_secs = poll_interval.as_secs(),
            "starting flag definition poller"
        );
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            // The ETag lives here and nowhere else.
            let mut etag: Option<String> = None;

            match source.fetch(&store, etag.as_deref()).await {
                FetchOutcome::Updated(new_etag) => {
                    info!("initial flag definitions loaded");
                    etag = new_etag;
                }
                _ => warn!("failed to load initial flag definitions, will retry on next poll"),
            }

            let mut interval = tokio::time::interval(poll_interval);
            interval.tick().await; // Skip the first immediate tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let FetchOutcome::Updated(new_etag) =
                            source.fetch(&store, etag.as_deref()).await
                        {
                            etag = new_etag;
                        }
                    }
                }
            }
            trace!("flag poller stopped");
        });

        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Stop polling and wait for the task to exit.
    pub async fn stop(&mut self) {
        debug!("stopping flag poller");
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FlagPoller {
    fn drop(&mut self) {
        // Abort if the poller was never stopped gracefully.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

//! Server-side PostHog client.
//!
//! Events are captured into a bounded in-memory queue and delivered in
//! batches by background tasks; feature flags are answered from a locally
//! polled definition snapshot whenever the decision can be made without
//! the server, and from the remote decision endpoint otherwise. All HTTP
//! goes through one transport with capped exponential backoff and
//! `Retry-After` honoring.
//!
//! ```no_run
//! use posthog_server_rs::{client, ClientOptionsBuilder, Event};
//!
//! # async fn run() {
//! let options = ClientOptionsBuilder::new()
//!     .api_key("phc_project_token")
//!     .personal_api_key("phx_personal_key")
//!     .build()
//!     .unwrap();
//! let client = client(options).await;
//!
//! let mut event = Event::new("user signed up", "distinct-id-1");
//! event.insert_prop("plan", "pro").unwrap();
//! client.capture(event);
//!
//! let enabled = client
//!     .is_feature_enabled("new-onboarding", "distinct-id-1", None, None, None)
//!     .await
//!     .unwrap_or(false);
//! # let _ = enabled;
//! client.dispose().await;
//! # }
//! ```

pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod event;
pub mod flags;
pub mod global;
pub mod pipeline;
pub mod transport;

pub use client::{client, Client, RequestScope};
pub use config::{ClientOptions, ClientOptionsBuilder};
pub use error::{ApiErrorBody, Error};
pub use event::{Event, GroupIdentify};
pub use flags::{
    DecisionCache, FeatureFlag, FlagDecisions, FlagValue, LocalEvaluator, LocalFlagResult,
};
pub use pipeline::{BatchPipeline, PipelineOptions};
pub use transport::Transport;

/// Re-exported so callers can cancel in-flight transport work without
/// depending on `tokio-util` directly.
pub use tokio_util::sync::CancellationToken;

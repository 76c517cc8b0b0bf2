use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::ClientOptions;
use crate::endpoints::{Endpoint, EndpointManager};
use crate::event::{
    BatchContext, BatchRequest, CaptureResponse, Event, GroupIdentify, InnerEvent,
    SingleCaptureRequest,
};
use crate::flags::cache::{context_key, DecisionCache};
use crate::flags::poller::{FlagDefinitionSource, FlagPoller, FlagSourceConfig, SnapshotStore};
use crate::flags::types::{DecideRequest, FlagDecisions, FlagValue};
use crate::flags::{LocalEvaluator, LocalFlagResult};
use crate::pipeline::{BatchPipeline, PipelineOptions};
use crate::transport::Transport;
use crate::Error;

/// A [`Client`] batches events toward the ingestion API and answers
/// feature-flag queries, locally when a snapshot is available and through
/// the remote decision endpoint otherwise.
pub struct Client {
    options: ClientOptions,
    endpoints: EndpointManager,
    transport: Arc<Transport>,
    pipeline: BatchPipeline<Event>,
    evaluator: Option<LocalEvaluator>,
    poller: Mutex<Option<FlagPoller>>,
    cancel: CancellationToken,
}

/// Constructs a new client from the options provided. Spawns the batching
/// tasks, plus the flag definition poller when a personal API key is
/// configured.
pub async fn client<C: Into<ClientOptions>>(options: C) -> Client {
    let options = options.into();
    let endpoints = EndpointManager::new(options.host.clone());
    let transport = Arc::new(Transport::new(&options));
    let cancel = CancellationToken::new();

    let pipeline = {
        let transport = transport.clone();
        let cancel = cancel.clone();
        let url = endpoints.build_url(Endpoint::Batch);
        let api_key = options.api_key.clone();
        let super_properties = options.super_properties.clone();
        BatchPipeline::new(
            PipelineOptions {
                flush_at: options.flush_at,
                flush_interval: options.flush_interval,
                max_batch_size: options.max_batch_size,
                max_queue_size: options.max_queue_size,
            },
            move |events: Vec<Event>| {
                let transport = transport.clone();
                let cancel = cancel.clone();
                let url = url.clone();
                let api_key = api_key.clone();
                let super_properties = super_properties.clone();
                async move {
                    // Wire events materialize here, under a context fresh
                    // for this batch; the UUIDs minted now stay stable
                    // across the transport's retries.
                    let context = BatchContext::new(&super_properties);
                    let batch: Vec<InnerEvent> = events
                        .into_iter()
                        .map(|event| InnerEvent::new(event, &context))
                        .collect();
                    let size = batch.len();
                    let request = BatchRequest {
                        api_key,
                        historical_migrations: false,
                        batch,
                    };
                    let response: CaptureResponse =
                        transport.post_json(&url, &request, &cancel).await?;
                    if response.is_ok() {
                        trace!(size, "batch delivered");
                    } else {
                        warn!(size, "batch endpoint reported a non-ok status");
                    }
                    Ok(())
                }
            },
        )
    };

    let (evaluator, poller) = match options.personal_api_key {
        Some(ref personal_api_key) => {
            let store = Arc::new(SnapshotStore::new());
            let source = FlagDefinitionSource::new(FlagSourceConfig {
                personal_api_key: personal_api_key.clone(),
                url: endpoints.build_local_eval_url(&options.api_key),
                request_timeout: options.request_timeout,
            });
            let poller = FlagPoller::start(source, store.clone(), options.flag_poll_interval);
            (Some(LocalEvaluator::new(store)), Some(poller))
        }
        None => {
            debug!("personal_api_key not set, local flag evaluation disabled");
            (None, None)
        }
    };

    Client {
        options,
        endpoints,
        transport,
        pipeline,
        evaluator,
        poller: Mutex::new(poller),
        cancel,
    }
}

impl Client {
    /// Queue an event for delivery. Returns whether the event was accepted;
    /// the only rejection cause is a disposed client. Never blocks: when
    /// the queue is full the oldest queued event is dropped instead.
    #[instrument(skip(self, event), level = "debug")]
    pub fn capture(&self, event: Event) -> bool {
        if self.options.is_disabled() {
            trace!("client is disabled, skipping capture");
            return true;
        }
        let event = if event.timestamp.is_none() {
            event.timestamp(Utc::now())
        } else {
            event
        };
        self.pipeline.enqueue(event)
    }

    /// Current depth of the event queue.
    pub fn pending_events(&self) -> usize {
        self.pipeline.count()
    }

    /// Drain the queue now. Completes once every queued event has been
    /// offered to the batch endpoint.
    pub async fn flush(&self) {
        self.pipeline.flush().await;
    }

    /// Stop background work, deliver what is queued, and reject further
    /// captures. Idempotent.
    pub async fn dispose(&self) {
        let poller = self.poller.lock().unwrap().take();
        if let Some(mut poller) = poller {
            poller.stop().await;
        }
        self.pipeline.dispose().await;
    }

    /// Record identity-level properties for a user via `$identify`.
    #[instrument(skip(self, properties, distinct_id), level = "debug")]
    pub async fn identify<D: Into<String>>(
        &self,
        distinct_id: D,
        properties: HashMap<String, Value>,
    ) -> Result<(), Error> {
        let distinct_id = distinct_id.into();
        let mut event = Event::new("$identify", distinct_id.as_str());
        event.insert_prop("$set", properties)?;
        self.capture_single(event).await
    }

    /// Link a previous (e.g. anonymous) id to a distinct id.
    #[instrument(skip(self, distinct_id, alias), level = "debug")]
    pub async fn alias<D: Into<String>, A: Into<String>>(
        &self,
        distinct_id: D,
        alias: A,
    ) -> Result<(), Error> {
        let distinct_id = distinct_id.into();
        let mut event = Event::new("$create_alias", distinct_id.as_str());
        event.insert_prop("distinct_id", distinct_id.as_str())?;
        event.insert_prop("alias", alias.into())?;
        self.capture_single(event).await
    }

    /// Record group-level properties via `$groupidentify`.
    #[instrument(skip(self, group), level = "debug")]
    pub async fn group_identify(&self, group: GroupIdentify) -> Result<(), Error> {
        self.capture_single(group.into()).await
    }

    /// Send a batch straight to the historical-migration ingestion topic,
    /// bypassing the queue.
    pub async fn capture_batch_historical(&self, events: Vec<Event>) -> Result<(), Error> {
        if self.options.is_disabled() {
            return Ok(());
        }
        if self.pipeline.is_disposed() {
            return Err(Error::Disposed);
        }
        let context = BatchContext::new(&self.options.super_properties);
        let batch: Vec<InnerEvent> = events
            .into_iter()
            .map(|event| InnerEvent::new(event, &context))
            .collect();
        let request = BatchRequest {
            api_key: self.options.api_key.clone(),
            historical_migrations: true,
            batch,
        };
        let url = self.endpoints.build_url(Endpoint::Batch);
        let response: CaptureResponse =
            self.transport.post_json(&url, &request, &self.cancel).await?;
        if !response.is_ok() {
            warn!("historical batch endpoint reported a non-ok status");
        }
        Ok(())
    }

    async fn capture_single(&self, event: Event) -> Result<(), Error> {
        if self.options.is_disabled() {
            return Ok(());
        }
        if self.pipeline.is_disposed() {
            return Err(Error::Disposed);
        }
        let event = if event.timestamp.is_none() {
            event.timestamp(Utc::now())
        } else {
            event
        };
        let context = BatchContext::new(&self.options.super_properties);
        let request = SingleCaptureRequest {
            api_key: self.options.api_key.clone(),
            event: InnerEvent::new(event, &context),
        };
        let url = self.endpoints.build_url(Endpoint::Capture);
        let response: CaptureResponse =
            self.transport.post_json(&url, &request, &self.cancel).await?;
        if !response.is_ok() {
            warn!("capture endpoint reported a non-ok status");
        }
        Ok(())
    }

    /// Get a feature flag value for a user. Tries the local snapshot
    /// first; anything undecidable falls back to the decision endpoint.
    #[must_use = "feature flag result should be used"]
    #[instrument(skip_all, level = "debug")]
    pub async fn get_feature_flag<K: Into<String>, D: Into<String>>(
        &self,
        key: K,
        distinct_id: D,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<Option<FlagValue>, Error> {
        let key = key.into();
        let distinct_id = distinct_id.into();

        if let Some(value) = self.evaluate_locally(
            &key,
            &distinct_id,
            groups.as_ref(),
            person_properties.as_ref(),
            group_properties.as_ref(),
        ) {
            return Ok(Some(value));
        }

        trace!(flag = %key, "fetching flag from the decision endpoint");
        let decisions = self
            .fetch_remote_flags(distinct_id, groups, person_properties, group_properties)
            .await?;
        Ok(decisions.flags.get(&key).cloned())
    }

    /// Check if a feature flag is enabled for a user. A variant assignment
    /// counts as enabled; an unknown flag does not.
    #[must_use = "feature flag enabled check result should be used"]
    pub async fn is_feature_enabled<K: Into<String>, D: Into<String>>(
        &self,
        key: K,
        distinct_id: D,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<bool, Error> {
        let value = self
            .get_feature_flag(
                key.into(),
                distinct_id.into(),
                groups,
                person_properties,
                group_properties,
            )
            .await?;
        Ok(value.map(|v| v.is_enabled()).unwrap_or(false))
    }

    /// All flag values and payloads for a user. Local decisions are merged
    /// with remote ones; where both exist the server wins.
    #[must_use = "feature flags result should be used"]
    #[instrument(skip_all, level = "debug")]
    pub async fn get_all_feature_flags<D: Into<String>>(
        &self,
        distinct_id: D,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<FlagDecisions, Error> {
        let distinct_id = distinct_id.into();

        if let Some(ref evaluator) = self.evaluator {
            let empty_person = HashMap::new();
            let empty_groups = HashMap::new();
            let empty_group_props = HashMap::new();
            let summary = evaluator.evaluate_all(
                &distinct_id,
                person_properties.as_ref().unwrap_or(&empty_person),
                groups.as_ref().unwrap_or(&empty_groups),
                group_properties.as_ref().unwrap_or(&empty_group_props),
            );

            if summary.requires_remote.is_empty() && evaluator.has_definitions() {
                return Ok(FlagDecisions {
                    flags: summary.flags,
                    payloads: summary.payloads,
                    ..FlagDecisions::default()
                });
            }

            debug!(
                remote_count = summary.requires_remote.len(),
                "some flags need remote evaluation, merging with decide"
            );
            let remote = self
                .fetch_remote_flags(distinct_id, groups, person_properties, group_properties)
                .await?;
            let mut flags = summary.flags;
            flags.extend(remote.flags);
            let mut payloads = summary.payloads;
            payloads.extend(remote.payloads);
            return Ok(FlagDecisions {
                flags,
                payloads,
                errors_while_computing_flags: remote.errors_while_computing_flags,
                quota_limited: remote.quota_limited,
                request_id: remote.request_id,
                evaluated_at: remote.evaluated_at,
            });
        }

        self.fetch_remote_flags(distinct_id, groups, person_properties, group_properties)
            .await
    }

    /// Get a feature flag's payload for a user.
    #[must_use = "feature flag payload result should be used"]
    pub async fn get_feature_flag_payload<K: Into<String>, D: Into<String>>(
        &self,
        key: K,
        distinct_id: D,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<Option<Value>, Error> {
        let key = key.into();
        let distinct_id = distinct_id.into();

        if let Some(ref evaluator) = self.evaluator {
            let empty_person = HashMap::new();
            let empty_groups = HashMap::new();
            let empty_group_props = HashMap::new();
            let result = evaluator.evaluate(
                &key,
                &distinct_id,
                person_properties.as_ref().unwrap_or(&empty_person),
                groups.as_ref().unwrap_or(&empty_groups),
                group_properties.as_ref().unwrap_or(&empty_group_props),
            );
            if let LocalFlagResult::Resolved { payload, .. } = result {
                return Ok(payload);
            }
        }

        let decisions = self
            .fetch_remote_flags(distinct_id, groups, person_properties, group_properties)
            .await?;
        Ok(decisions.payloads.get(&key).cloned())
    }

    /// Fetch a flag's remote-config payload. Requires the personal API key.
    pub async fn get_remote_config_payload(&self, key: &str) -> Result<Value, Error> {
        let personal_api_key = self.options.personal_api_key.as_deref().ok_or_else(|| {
            Error::Configuration("personal_api_key is required for remote config".to_string())
        })?;
        let url = self.endpoints.build_remote_config_url(key);
        self.transport
            .get_json(&url, Some(personal_api_key), &self.cancel)
            .await
    }

    /// Open a request scope whose remote flag decisions are memoized per
    /// evaluation context.
    pub fn request_scope(&self) -> RequestScope<'_> {
        RequestScope {
            client: self,
            cache: DecisionCache::new(),
        }
    }

    fn evaluate_locally(
        &self,
        key: &str,
        distinct_id: &str,
        groups: Option<&HashMap<String, String>>,
        person_properties: Option<&HashMap<String, Value>>,
        group_properties: Option<&HashMap<String, HashMap<String, Value>>>,
    ) -> Option<FlagValue> {
        let evaluator = self.evaluator.as_ref()?;
        let empty_person = HashMap::new();
        let empty_groups = HashMap::new();
        let empty_group_props = HashMap::new();
        let result = evaluator.evaluate(
            key,
            distinct_id,
            person_properties.unwrap_or(&empty_person),
            groups.unwrap_or(&empty_groups),
            group_properties.unwrap_or(&empty_group_props),
        );
        match result {
            LocalFlagResult::Resolved { value, .. } => {
                debug!(flag = %key, ?value, "flag evaluated locally");
                Some(value)
            }
            LocalFlagResult::Undefined => {
                debug!(flag = %key, "flag not found locally, falling back to decide");
                None
            }
            LocalFlagResult::RequiresRemote(reason) => {
                debug!(flag = %key, reason = %reason, "flag needs remote evaluation");
                None
            }
        }
    }

    async fn fetch_remote_flags(
        &self,
        distinct_id: String,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<FlagDecisions, Error> {
        let request = DecideRequest {
            api_key: self.options.api_key.clone(),
            distinct_id,
            groups,
            person_properties,
            group_properties,
        };
        let url = self.endpoints.build_url(Endpoint::Decide);
        let response: crate::flags::types::DecideResponse =
            self.transport.post_json(&url, &request, &self.cancel).await?;
        let decisions: FlagDecisions = response.into();
        if decisions.errors_while_computing_flags {
            warn!("server reported errors while computing flags");
        }
        Ok(decisions)
    }
}

/// A request-scoped view of the client. Remote decision sets fetched
/// through the scope are memoized on (distinct id, properties, groups), so
/// repeated flag lookups for one request cost at most one network call per
/// distinct context.
pub struct RequestScope<'a> {
    client: &'a Client,
    cache: DecisionCache,
}

impl RequestScope<'_> {
    /// All flag values and payloads for the context, served from the scope
    /// cache when the same context was already fetched.
    pub async fn get_all_flags<D: Into<String>>(
        &self,
        distinct_id: D,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<FlagDecisions, Error> {
        let distinct_id = distinct_id.into();

        if let Some(ref evaluator) = self.client.evaluator {
            let empty_person = HashMap::new();
            let empty_groups = HashMap::new();
            let empty_group_props = HashMap::new();
            let summary = evaluator.evaluate_all(
                &distinct_id,
                person_properties.as_ref().unwrap_or(&empty_person),
                groups.as_ref().unwrap_or(&empty_groups),
                group_properties.as_ref().unwrap_or(&empty_group_props),
            );
            if summary.requires_remote.is_empty() && evaluator.has_definitions() {
                return Ok(FlagDecisions {
                    flags: summary.flags,
                    payloads: summary.payloads,
                    ..FlagDecisions::default()
                });
            }

            let remote = self
                .cached_remote(&distinct_id, groups, person_properties, group_properties)
                .await?;
            let mut flags = summary.flags;
            flags.extend(remote.flags.clone());
            let mut payloads = summary.payloads;
            payloads.extend(remote.payloads.clone());
            return Ok(FlagDecisions {
                flags,
                payloads,
                errors_while_computing_flags: remote.errors_while_computing_flags,
                quota_limited: remote.quota_limited.clone(),
                request_id: remote.request_id.clone(),
                evaluated_at: remote.evaluated_at.clone(),
            });
        }

        let remote = self
            .cached_remote(&distinct_id, groups, person_properties, group_properties)
            .await?;
        Ok((*remote).clone())
    }

    /// One flag value for the context; local evaluation first, then the
    /// scope-cached decision set.
    pub async fn get_feature_flag<K: Into<String>, D: Into<String>>(
        &self,
        key: K,
        distinct_id: D,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<Option<FlagValue>, Error> {
        let key = key.into();
        let distinct_id = distinct_id.into();

        if let Some(value) = self.client.evaluate_locally(
            &key,
            &distinct_id,
            groups.as_ref(),
            person_properties.as_ref(),
            group_properties.as_ref(),
        ) {
            return Ok(Some(value));
        }

        let decisions = self
            .cached_remote(&distinct_id, groups, person_properties, group_properties)
            .await?;
        Ok(decisions.flags.get(&key).cloned())
    }

    pub async fn is_feature_enabled<K: Into<String>, D: Into<String>>(
        &self,
        key: K,
        distinct_id: D,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<bool, Error> {
        let value = self
            .get_feature_flag(
                key.into(),
                distinct_id.into(),
                groups,
                person_properties,
                group_properties,
            )
            .await?;
        Ok(value.map(|v| v.is_enabled()).unwrap_or(false))
    }

    /// Fetches through the decision cache. Only successful responses are
    /// stored, so a failed call is retried by the next lookup.
    async fn cached_remote(
        &self,
        distinct_id: &str,
        groups: Option<HashMap<String, String>>,
        person_properties: Option<HashMap<String, Value>>,
        group_properties: Option<HashMap<String, HashMap<String, Value>>>,
    ) -> Result<Arc<FlagDecisions>, Error> {
        let cache_key = context_key(
            distinct_id,
            groups.as_ref(),
            person_properties.as_ref(),
            group_properties.as_ref(),
        );
        if let Some(hit) = self.cache.get(&cache_key) {
            trace!("decision cache hit");
            return Ok(hit);
        }

        let decisions = self
            .client
            .fetch_remote_flags(
                distinct_id.to_string(),
                groups,
                person_properties,
                group_properties,
            )
            .await?;
        let decisions = Arc::new(decisions);
        self.cache.insert(cache_key, decisions.clone());
        Ok(decisions)
    }
}

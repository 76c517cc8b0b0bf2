use std::collections::HashMap;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Library identification reported in `$lib` and the `User-Agent` header.
pub(crate) const LIB_NAME: &str = env!("CARGO_PKG_NAME");
pub(crate) const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An analytics event as seen by application code.
///
/// Events are immutable once handed to the client: `capture` stamps the
/// timestamp and the queue consumes the record exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub(crate) event: String,
    pub(crate) distinct_id: String,
    pub(crate) properties: HashMap<String, serde_json::Value>,
    pub(crate) timestamp: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new<S: Into<String>>(event: S, distinct_id: S) -> Self {
        Self {
            event: event.into(),
            distinct_id: distinct_id.into(),
            properties: HashMap::new(),
            timestamp: None,
        }
    }

    /// Errors if `prop` fails to serialize
    pub fn insert_prop<K: Into<String>, P: Serialize>(
        &mut self,
        key: K,
        prop: P,
    ) -> Result<(), Error> {
        let as_json =
            serde_json::to_value(prop).map_err(|e| Error::Serialization(e.to_string()))?;
        let _ = self.properties.insert(key.into(), as_json);
        Ok(())
    }

    /// Overrides the event timestamp; unset events are stamped at capture.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event
    }

    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }
}

/// Per-batch materialization context. Built once per flushed chunk so every
/// event in the chunk sees the same auto-property set.
pub(crate) struct BatchContext {
    super_properties: HashMap<String, serde_json::Value>,
    lib_version: Option<Version>,
}

impl BatchContext {
    pub(crate) fn new(super_properties: &HashMap<String, serde_json::Value>) -> Self {
        Self {
            super_properties: super_properties.clone(),
            lib_version: LIB_VERSION.parse::<Version>().ok(),
        }
    }
}

/// Wire representation of one event.
#[derive(Debug, Serialize)]
pub(crate) struct InnerEvent {
    event: String,
    properties: WireProperties,
    timestamp: DateTime<Utc>,
    uuid: Uuid,
}

/// The server expects `distinct_id` echoed inside `properties`.
#[derive(Debug, Serialize)]
pub(crate) struct WireProperties {
    distinct_id: String,
    #[serde(flatten)]
    props: HashMap<String, serde_json::Value>,
}

impl InnerEvent {
    /// Materializes the wire event: super properties first, caller
    /// properties over them, then library identification. The UUID minted
    /// here is what lets the server dedup a batch resent by the retry loop.
    pub(crate) fn new(event: Event, ctx: &BatchContext) -> Self {
        let mut props = ctx.super_properties.clone();
        props.extend(event.properties);

        props.insert(
            "$lib".into(),
            serde_json::Value::String(LIB_NAME.to_string()),
        );
        props.insert(
            "$lib_version".into(),
            serde_json::Value::String(LIB_VERSION.to_string()),
        );
        if let Some(ref version) = ctx.lib_version {
            props.insert(
                "$lib_version__major".into(),
                serde_json::Value::Number(version.major.into()),
            );
            props.insert(
                "$lib_version__minor".into(),
                serde_json::Value::Number(version.minor.into()),
            );
            props.insert(
                "$lib_version__patch".into(),
                serde_json::Value::Number(version.patch.into()),
            );
        }

        // Default on; a caller-provided value survives.
        props
            .entry("$geoip_disable".to_string())
            .or_insert(serde_json::Value::Bool(true));

        Self {
            event: event.event,
            properties: WireProperties {
                distinct_id: event.distinct_id,
                props,
            },
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            uuid: Uuid::new_v4(),
        }
    }

    #[cfg(test)]
    pub(crate) fn props(&self) -> &HashMap<String, serde_json::Value> {
        &self.properties.props
    }
}

/// Body for `POST /capture/`: a single wire event plus the project key.
#[derive(Debug, Serialize)]
pub(crate) struct SingleCaptureRequest {
    pub api_key: String,
    #[serde(flatten)]
    pub event: InnerEvent,
}

/// Body for `POST /batch/`.
#[derive(Debug, Serialize)]
pub(crate) struct BatchRequest {
    pub api_key: String,
    pub historical_migrations: bool,
    pub batch: Vec<InnerEvent>,
}

/// Response from the capture and batch endpoints. The server answers `1`
/// on the single-event endpoint and `"Ok"` on the batch endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct CaptureResponse {
    pub status: CaptureStatus,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub(crate) enum CaptureStatus {
    Code(i64),
    Text(String),
}

impl CaptureResponse {
    pub(crate) fn is_ok(&self) -> bool {
        match &self.status {
            CaptureStatus::Code(code) => *code == 1,
            CaptureStatus::Text(text) => text.eq_ignore_ascii_case("ok"),
        }
    }
}

/// Builder for `$groupidentify` events.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupIdentify {
    group_type: String,
    group_key: String,
    group_properties: HashMap<String, serde_json::Value>,
    timestamp: Option<DateTime<Utc>>,
}

impl GroupIdentify {
    pub fn new<S: Into<String>>(group_type: S, group_key: S) -> Self {
        Self {
            group_type: group_type.into(),
            group_key: group_key.into(),
            group_properties: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn insert_prop<K: Into<String>, P: Serialize>(
        &mut self,
        key: K,
        prop: P,
    ) -> Result<(), Error> {
        let as_json =
            serde_json::to_value(prop).map_err(|e| Error::Serialization(e.to_string()))?;
        let _ = self.group_properties.insert(key.into(), as_json);
        Ok(())
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl From<GroupIdentify> for Event {
    fn from(group_identify: GroupIdentify) -> Self {
        let distinct_id = format!(
            "{}_{}",
            group_identify.group_type, group_identify.group_key
        );

        let mut props: HashMap<String, serde_json::Value> = HashMap::with_capacity(3);
        props.insert("$group_type".into(), group_identify.group_type.into());
        props.insert("$group_key".into(), group_identify.group_key.into());
        if !group_identify.group_properties.is_empty() {
            props.insert(
                "$group_set".into(),
                serde_json::Value::Object(group_identify.group_properties.into_iter().collect()),
            );
        }

        Self {
            event: "$groupidentify".into(),
            distinct_id,
            properties: props,
            timestamp: group_identify.timestamp,
        }
    }
}

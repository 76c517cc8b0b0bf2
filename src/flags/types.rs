use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The value of a feature flag evaluation.
///
/// Feature flags resolve to either a boolean (enabled/disabled) or a string
/// (multivariate flags assign users to a named variant).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FlagValue {
    /// Flag is either enabled (true) or disabled (false)
    Boolean(bool),
    /// Flag resolves to a specific variant key (e.g., "control", "test")
    String(String),
}

impl FlagValue {
    /// A variant assignment counts as enabled.
    pub fn is_enabled(&self) -> bool {
        match self {
            FlagValue::Boolean(enabled) => *enabled,
            FlagValue::String(_) => true,
        }
    }

    pub fn variant(&self) -> Option<&str> {
        match self {
            FlagValue::String(variant) => Some(variant),
            FlagValue::Boolean(_) => None,
        }
    }
}

impl Default for FlagValue {
    fn default() -> Self {
        FlagValue::Boolean(false)
    }
}

/// Comparison operators understood by the property matcher. Unrecognized
/// wire tokens land on [`Operator::Unknown`] and evaluate inconclusively
/// instead of failing deserialization of the whole flag set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Exact,
    IsNot,
    IsSet,
    IsNotSet,
    Gt,
    Lt,
    Gte,
    Lte,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    IsDateBefore,
    IsDateAfter,
    In,
    NotIn,
    FlagEvaluatesTo,
    #[serde(other)]
    Unknown,
}

impl Default for Operator {
    fn default() -> Self {
        Operator::Exact
    }
}

/// What a property filter is matched against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Person,
    Group,
    Cohort,
    Flag,
    #[serde(other)]
    Other,
}

impl Default for FilterType {
    fn default() -> Self {
        FilterType::Person
    }
}

/// A single property filter inside a flag's targeting rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyFilter {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub operator: Operator,
    #[serde(rename = "type", default)]
    pub filter_type: FilterType,
    /// For group filters: which group type the key refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_type_index: Option<i64>,
    /// Inverts a conclusive match result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negation: Option<bool>,
    /// For flag filters: the flag keys that must resolve before this one,
    /// in resolution order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_chain: Option<Vec<String>>,
}

/// A condition group: a conjunction of property filters plus a rollout
/// percentage and an optional forced variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagCondition {
    #[serde(default)]
    pub properties: Vec<PropertyFilter>,
    /// Percentage of matching subjects the group applies to; absent means 100.
    pub rollout_percentage: Option<f64>,
    pub variant: Option<String>,
}

/// Multivariate (A/B/n) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MultivariateFilter {
    pub variants: Vec<MultivariateVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultivariateVariant {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub rollout_percentage: f64,
}

/// Targeting rules and configuration for a feature flag.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FeatureFlagFilters {
    /// Condition groups, evaluated in order; the first satisfied group wins.
    #[serde(default)]
    pub groups: Vec<FlagCondition>,
    #[serde(default)]
    pub multivariate: Option<MultivariateFilter>,
    /// JSON payloads keyed by variant key (or "true" for boolean flags).
    #[serde(default)]
    pub payloads: HashMap<String, Value>,
    /// When set, the flag hashes on the identified group instead of the
    /// person; the index resolves through the snapshot's group-type map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_group_type_index: Option<i64>,
}

/// A feature flag definition from the flag-definition endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureFlag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub key: String,
    /// Inactive flags always resolve to false.
    pub active: bool,
    /// Deleted definitions never match; callers fall back to the server.
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub filters: FeatureFlagFilters,
    /// Decisions for continuity-pinned flags can only come from the server.
    #[serde(default)]
    pub ensure_experience_continuity: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Boolean connective inside a cohort filter tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupLogic {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

impl Default for GroupLogic {
    fn default() -> Self {
        GroupLogic::And
    }
}

/// A cohort definition: an AND/OR tree over property filters, referenced
/// from flag conditions by cohort id.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CohortPropertyGroup {
    #[serde(rename = "type", default)]
    pub logic: GroupLogic,
    #[serde(default)]
    pub values: Vec<CohortNode>,
}

/// A node in a cohort tree: either a leaf filter or a nested group. The
/// `Filter` variant must be tried first: a leaf is recognizable by its
/// mandatory `key`, while every object would satisfy the group's defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CohortNode {
    Filter(PropertyFilter),
    Group(CohortPropertyGroup),
}

/// Wire document served by the flag-definition endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalEvaluationResponse {
    pub flags: Vec<FeatureFlag>,
    /// Group type index (as a string key) to group type name.
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
    #[serde(default)]
    pub cohorts: HashMap<String, CohortPropertyGroup>,
}

/// An immutable bundle of flag state. The loader builds a fresh snapshot on
/// every successful fetch and publishes it with a single reference swap, so
/// an evaluation never observes a half-updated flag set.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FlagSnapshot {
    pub flags: HashMap<String, FeatureFlag>,
    pub group_type_mapping: HashMap<String, String>,
    pub cohorts: HashMap<String, CohortPropertyGroup>,
    pub etag: Option<String>,
}

impl FlagSnapshot {
    pub fn from_response(response: LocalEvaluationResponse, etag: Option<String>) -> Self {
        let flags = response
            .flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect();
        Self {
            flags,
            group_type_mapping: response.group_type_mapping,
            cohorts: response.cohorts,
            etag,
        }
    }
}

/// Body for `POST /decide/?v=3`.
#[derive(Debug, Serialize)]
pub(crate) struct DecideRequest {
    pub api_key: String,
    pub distinct_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_properties: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_properties: Option<HashMap<String, HashMap<String, Value>>>,
}

/// Response from the remote-decision endpoint. The server answers either
/// with the flat legacy shape or with per-flag detail records.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DecideResponse {
    Detailed {
        flags: HashMap<String, FlagDetail>,
        #[serde(rename = "errorsWhileComputingFlags", default)]
        errors_while_computing_flags: bool,
        #[serde(rename = "quotaLimited", default)]
        quota_limited: Option<Vec<String>>,
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
        #[serde(rename = "evaluatedAt", alias = "evaluated_at", default)]
        evaluated_at: Option<String>,
    },
    Legacy {
        #[serde(rename = "featureFlags")]
        feature_flags: HashMap<String, FlagValue>,
        #[serde(rename = "featureFlagPayloads", default)]
        feature_flag_payloads: HashMap<String, Value>,
        #[serde(rename = "errorsWhileComputingFlags", default)]
        errors_while_computing_flags: bool,
        #[serde(rename = "quotaLimited", default)]
        quota_limited: Option<Vec<String>>,
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
        #[serde(rename = "evaluatedAt", alias = "evaluated_at", default)]
        evaluated_at: Option<String>,
    },
}

/// Per-flag decision detail, as served by the newer decision endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDetail {
    pub key: String,
    pub enabled: bool,
    pub variant: Option<String>,
    #[serde(default)]
    pub reason: Option<FlagReason>,
    #[serde(default)]
    pub metadata: Option<FlagMetadata>,
}

/// Why a flag evaluated the way it did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagReason {
    pub code: String,
    #[serde(default)]
    pub condition_index: Option<usize>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagMetadata {
    pub id: u64,
    pub version: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Normalized remote decision set: flag values, payloads, and the response
/// metadata the server attaches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagDecisions {
    pub flags: HashMap<String, FlagValue>,
    pub payloads: HashMap<String, Value>,
    pub errors_while_computing_flags: bool,
    pub quota_limited: Option<Vec<String>>,
    pub request_id: Option<String>,
    /// Server-side evaluation timestamp, when the endpoint reports one.
    pub evaluated_at: Option<String>,
}

impl From<DecideResponse> for FlagDecisions {
    fn from(response: DecideResponse) -> Self {
        match response {
            DecideResponse::Detailed {
                flags,
                errors_while_computing_flags,
                quota_limited,
                request_id,
                evaluated_at,
            } => {
                let mut values = HashMap::new();
                let mut payloads = HashMap::new();
                for (key, detail) in flags {
                    let value = if detail.enabled {
                        match detail.variant {
                            Some(variant) => FlagValue::String(variant),
                            None => FlagValue::Boolean(true),
                        }
                    } else {
                        FlagValue::Boolean(false)
                    };
                    values.insert(key.clone(), value);
                    if let Some(payload) = detail.metadata.and_then(|m| m.payload) {
                        payloads.insert(key, payload);
                    }
                }
                Self {
                    flags: values,
                    payloads,
                    errors_while_computing_flags,
                    quota_limited,
                    request_id,
                    evaluated_at,
                }
            }
            DecideResponse::Legacy {
                feature_flags,
                feature_flag_payloads,
                errors_while_computing_flags,
                quota_limited,
                request_id,
                evaluated_at,
            } => Self {
                flags: feature_flags,
                payloads: feature_flag_payloads,
                errors_while_computing_flags,
                quota_limited,
                request_id,
                evaluated_at,
            },
        }
    }
}

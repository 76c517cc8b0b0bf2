use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::trace;

use crate::flags::matcher::{match_property, EvalError, EvalResult};
use crate::flags::poller::SnapshotStore;
use crate::flags::types::{
    CohortNode, CohortPropertyGroup, FeatureFlag, FilterType, FlagCondition, FlagSnapshot,
    FlagValue, Operator, PropertyFilter,
};

const LONG_SCALE: f64 = 0xFFFFFFFFFFFFFFFu64 as f64; // Must be exactly 15 F's to match the other SDKs

/// Salt used for rollout percentage hashing. Intentionally empty to match
/// PostHog's consistent hashing across all SDKs.
const ROLLOUT_HASH_SALT: &str = "";

/// Salt used for multivariate variant selection.
const VARIANT_HASH_SALT: &str = "variant";

/// Outcome of evaluating one flag against the local snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalFlagResult {
    /// The key is not in the snapshot (or the definition was deleted).
    Undefined,
    /// Conclusive local decision; disabled flags resolve here too.
    Resolved {
        value: FlagValue,
        payload: Option<Value>,
    },
    /// The decision needs the remote endpoint (experience continuity,
    /// missing group, static cohort, dependency cycle, or an inconclusive
    /// property).
    RequiresRemote(String),
}

/// Result of a whole-snapshot evaluation. Keys that could not be decided
/// locally are listed so the caller can fetch them remotely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalEvaluationSummary {
    pub flags: HashMap<String, FlagValue>,
    pub payloads: HashMap<String, Value>,
    pub requires_remote: Vec<String>,
}

/// Compute a deterministic hash in `[0, 1)` for feature flag bucketing.
///
/// SHA-1 over `<key>.<identifier><salt>`, first 15 hex digits read as a
/// 60-bit integer, divided by 2^60 - 1. Stable across SDK versions and
/// identical to the server's bucketing.
pub fn hash_key(key: &str, hashed_identifier: &str, salt: &str) -> f64 {
    let hash_input = format!("{}.{}{}", key, hashed_identifier, salt);
    let mut hasher = Sha1::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();
    let hex_str = format!("{:x}", result);
    let hash_val = u64::from_str_radix(&hex_str[..15], 16).unwrap_or(0);
    hash_val as f64 / LONG_SCALE
}

/// Evaluates feature flags against the current snapshot without touching
/// the network. Reads are lock-free after the one snapshot load; a swap
/// mid-evaluation is invisible.
#[derive(Clone)]
pub struct LocalEvaluator {
    store: Arc<SnapshotStore>,
}

struct EvalContext<'a> {
    snapshot: &'a FlagSnapshot,
    distinct_id: &'a str,
    person_properties: &'a HashMap<String, Value>,
    groups: &'a HashMap<String, String>,
    group_properties: &'a HashMap<String, HashMap<String, Value>>,
    now: DateTime<Utc>,
    /// Dependency results memoized for the duration of one top-level call.
    memo: RefCell<HashMap<String, FlagValue>>,
    /// Flags currently being evaluated, for cycle detection.
    stack: RefCell<Vec<String>>,
}

impl LocalEvaluator {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store }
    }

    /// Evaluate a single flag. Pure in (snapshot, inputs, now).
    pub fn evaluate(
        &self,
        key: &str,
        distinct_id: &str,
        person_properties: &HashMap<String, Value>,
        groups: &HashMap<String, String>,
        group_properties: &HashMap<String, HashMap<String, Value>>,
    ) -> LocalFlagResult {
        self.evaluate_at(
            key,
            distinct_id,
            person_properties,
            groups,
            group_properties,
            Utc::now(),
        )
    }

    /// [`LocalEvaluator::evaluate`] with an explicit clock reading, which
    /// anchors relative date filters.
    pub fn evaluate_at(
        &self,
        key: &str,
        distinct_id: &str,
        person_properties: &HashMap<String, Value>,
        groups: &HashMap<String, String>,
        group_properties: &HashMap<String, HashMap<String, Value>>,
        now: DateTime<Utc>,
    ) -> LocalFlagResult {
        let snapshot = self.store.load();
        let ctx = EvalContext {
            snapshot: &*snapshot,
            distinct_id,
            person_properties,
            groups,
            group_properties,
            now,
            memo: RefCell::new(HashMap::new()),
            stack: RefCell::new(Vec::new()),
        };

        let result = match evaluate_memoized(&ctx, key) {
            Ok(value) => {
                let payload = ctx
                    .snapshot
                    .flags
                    .get(key)
                    .and_then(|flag| payload_for(flag, &value));
                LocalFlagResult::Resolved { value, payload }
            }
            Err(EvalError::Undefined) => LocalFlagResult::Undefined,
            Err(error) => LocalFlagResult::RequiresRemote(error.message().to_string()),
        };
        trace!(key, ?result, "local flag evaluation");
        result
    }

    /// Evaluate every flag in the snapshot. Flags that cannot be decided
    /// locally are omitted from the value map and listed in
    /// `requires_remote`.
    pub fn evaluate_all(
        &self,
        distinct_id: &str,
        person_properties: &HashMap<String, Value>,
        groups: &HashMap<String, String>,
        group_properties: &HashMap<String, HashMap<String, Value>>,
    ) -> LocalEvaluationSummary {
        let snapshot = self.store.load();
        let ctx = EvalContext {
            snapshot: &*snapshot,
            distinct_id,
            person_properties,
            groups,
            group_properties,
            now: Utc::now(),
            memo: RefCell::new(HashMap::new()),
            stack: RefCell::new(Vec::new()),
        };

        let mut summary = LocalEvaluationSummary::default();
        for (key, flag) in snapshot.flags.iter() {
            if flag.deleted {
                continue;
            }
            match evaluate_memoized(&ctx, key) {
                Ok(value) => {
                    if let Some(payload) = payload_for(flag, &value) {
                        summary.payloads.insert(key.clone(), payload);
                    }
                    summary.flags.insert(key.clone(), value);
                }
                Err(error) => {
                    trace!(key, reason = error.message(), "flag needs remote evaluation");
                    summary.requires_remote.push(key.clone());
                }
            }
        }
        summary.requires_remote.sort();
        summary
    }

    /// Whether the snapshot currently holds any definitions.
    pub fn has_definitions(&self) -> bool {
        !self.store.load().flags.is_empty()
    }
}

/// Evaluates `key` through the per-call memo, guarding against dependency
/// cycles via the in-progress stack.
fn evaluate_memoized(ctx: &EvalContext<'_>, key: &str) -> EvalResult<FlagValue> {
    if let Some(value) = ctx.memo.borrow().get(key) {
        return Ok(value.clone());
    }
    if ctx.stack.borrow().iter().any(|entry| entry == key) {
        return Err(EvalError::requires_remote(format!(
            "circular flag dependency involving '{}'",
            key
        )));
    }

    let flag = match ctx.snapshot.flags.get(key) {
        Some(flag) if !flag.deleted => flag,
        _ => return Err(EvalError::Undefined),
    };

    ctx.stack.borrow_mut().push(key.to_string());
    let outcome = match_flag(ctx, flag);
    ctx.stack.borrow_mut().pop();

    let value = outcome?;
    ctx.memo.borrow_mut().insert(key.to_string(), value.clone());
    Ok(value)
}

fn match_flag(ctx: &EvalContext<'_>, flag: &FeatureFlag) -> EvalResult<FlagValue> {
    if !flag.active {
        return Ok(FlagValue::Boolean(false));
    }
    if flag.ensure_experience_continuity.unwrap_or(false) {
        return Err(EvalError::requires_remote(format!(
            "flag '{}' has experience continuity enabled",
            flag.key
        )));
    }

    // Group-aggregated flags hash and match on the group, not the person.
    let (hashed_identifier, subject_properties) =
        match flag.filters.aggregation_group_type_index {
            Some(index) => {
                let group_type = ctx
                    .snapshot
                    .group_type_mapping
                    .get(&index.to_string())
                    .ok_or_else(|| {
                        EvalError::requires_remote(format!(
                            "flag '{}' aggregates on unknown group type index {}",
                            flag.key, index
                        ))
                    })?;
                let group_key = ctx.groups.get(group_type).ok_or_else(|| {
                    EvalError::requires_remote(format!(
                        "flag '{}' needs a '{}' group in the call",
                        flag.key, group_type
                    ))
                })?;
                let properties = ctx.group_properties.get(group_type);
                (group_key.as_str(), properties)
            }
            None => (ctx.distinct_id, Some(ctx.person_properties)),
        };
    let empty_properties = HashMap::new();
    let subject_properties = subject_properties.unwrap_or(&empty_properties);

    let mut inconclusive: Option<EvalError> = None;
    for condition in flag.filters.groups.iter() {
        match condition_matches(ctx, flag, condition, subject_properties, hashed_identifier) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => continue,
            Err(error @ EvalError::RequiresRemote(_)) => return Err(error),
            Err(error) => inconclusive = Some(error),
        }
    }

    match inconclusive {
        Some(error) => Err(EvalError::inconclusive(format!(
            "can't determine if flag '{}' is enabled: {}",
            flag.key,
            error.message()
        ))),
        None => Ok(FlagValue::Boolean(false)),
    }
}

/// One condition group: all property filters must hold, then the rollout
/// hash decides. `Ok(Some(value))` means the group selected.
fn condition_matches(
    ctx: &EvalContext<'_>,
    flag: &FeatureFlag,
    condition: &FlagCondition,
    subject_properties: &HashMap<String, Value>,
    hashed_identifier: &str,
) -> EvalResult<Option<FlagValue>> {
    for filter in condition.properties.iter() {
        if !match_filter(ctx, &flag.key, filter, subject_properties)? {
            return Ok(None);
        }
    }

    if let Some(rollout_percentage) = condition.rollout_percentage {
        let hash_value = hash_key(&flag.key, hashed_identifier, ROLLOUT_HASH_SALT);
        if hash_value > rollout_percentage / 100.0 {
            return Ok(None);
        }
    }

    // A valid variant override wins; otherwise the variant hash decides.
    if let Some(ref variant_override) = condition.variant {
        let declared = flag
            .filters
            .multivariate
            .as_ref()
            .map(|multivariate| {
                multivariate
                    .variants
                    .iter()
                    .any(|variant| &variant.key == variant_override)
            })
            .unwrap_or(false);
        if declared {
            return Ok(Some(FlagValue::String(variant_override.clone())));
        }
    }

    if let Some(variant) = hashed_variant(flag, hashed_identifier) {
        return Ok(Some(FlagValue::String(variant)));
    }
    Ok(Some(FlagValue::Boolean(true)))
}

/// Routes one property filter: cohorts and flag dependencies resolve
/// against the snapshot, everything else against the subject's attributes.
fn match_filter(
    ctx: &EvalContext<'_>,
    flag_key: &str,
    filter: &PropertyFilter,
    subject_properties: &HashMap<String, Value>,
) -> EvalResult<bool> {
    if filter.filter_type == FilterType::Cohort {
        return match_cohort_filter(ctx, filter);
    }
    if filter.filter_type == FilterType::Flag
        || filter.operator == Operator::FlagEvaluatesTo
        || filter.key.starts_with("$feature/")
    {
        return match_flag_dependency(ctx, flag_key, filter);
    }
    match_property(filter, subject_properties, ctx.now)
}

fn match_cohort_filter(ctx: &EvalContext<'_>, filter: &PropertyFilter) -> EvalResult<bool> {
    let cohort_id = match &filter.value {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        other => {
            return Err(EvalError::inconclusive(format!(
                "cohort id must be a string or number, got {:?}",
                other
            )));
        }
    };

    let cohort = ctx.snapshot.cohorts.get(&cohort_id).ok_or_else(|| {
        // Static cohorts are membership lists on the server and are never
        // part of the snapshot.
        EvalError::requires_remote(format!("cohort '{}' not in snapshot", cohort_id))
    })?;

    let in_cohort = match_cohort_tree(ctx, cohort)?;
    let matched = match filter.operator {
        Operator::In => in_cohort,
        Operator::NotIn => !in_cohort,
        other => {
            return Err(EvalError::inconclusive(format!(
                "unsupported cohort operator {:?}",
                other
            )));
        }
    };
    Ok(if filter.negation.unwrap_or(false) {
        !matched
    } else {
        matched
    })
}

/// AND/OR tree walk. Conclusive short-circuits win; an inconclusive child
/// only surfaces when no sibling decided the connective.
fn match_cohort_tree(ctx: &EvalContext<'_>, group: &CohortPropertyGroup) -> EvalResult<bool> {
    use crate::flags::types::GroupLogic;

    if group.values.is_empty() {
        return Ok(true);
    }

    let mut deferred: Option<EvalError> = None;
    for node in group.values.iter() {
        let result = match node {
            CohortNode::Group(inner) => match_cohort_tree(ctx, inner),
            CohortNode::Filter(filter) => {
                if filter.filter_type == FilterType::Cohort {
                    match_cohort_filter(ctx, filter)
                } else {
                    match_property(filter, ctx.person_properties, ctx.now)
                }
            }
        };
        match result {
            Ok(true) => {
                if group.logic == GroupLogic::Or {
                    return Ok(true);
                }
            }
            Ok(false) => {
                if group.logic == GroupLogic::And {
                    return Ok(false);
                }
            }
            Err(error @ EvalError::RequiresRemote(_)) => return Err(error),
            Err(error) => deferred = Some(error),
        }
    }

    if let Some(error) = deferred {
        return Err(error);
    }
    Ok(group.logic == GroupLogic::And)
}

fn match_flag_dependency(
    ctx: &EvalContext<'_>,
    flag_key: &str,
    filter: &PropertyFilter,
) -> EvalResult<bool> {
    let dependency_key = filter
        .key
        .strip_prefix("$feature/")
        .unwrap_or(filter.key.as_str());

    // The declared chain is resolved up front; a chain that loops back to
    // the flag under evaluation can never settle locally.
    if let Some(ref chain) = filter.dependency_chain {
        if chain.iter().any(|entry| entry == flag_key) {
            return Err(EvalError::requires_remote(format!(
                "circular dependency between '{}' and '{}'",
                flag_key, dependency_key
            )));
        }
        for entry in chain.iter() {
            if entry != dependency_key {
                evaluate_memoized(ctx, entry).map_err(undefined_dependency(entry))?;
            }
        }
    }

    let dependency_value =
        evaluate_memoized(ctx, dependency_key).map_err(undefined_dependency(dependency_key))?;
    let matched = flag_value_matches(&dependency_value, &filter.value);

    let matched = match filter.operator {
        Operator::FlagEvaluatesTo | Operator::Exact => matched,
        Operator::IsNot => !matched,
        other => {
            return Err(EvalError::inconclusive(format!(
                "unsupported flag dependency operator {:?}",
                other
            )));
        }
    };
    Ok(if filter.negation.unwrap_or(false) {
        !matched
    } else {
        matched
    })
}

/// A dependency missing from the snapshot is inconclusive rather than
/// "undefined": the outer flag still exists, it just cannot settle here.
fn undefined_dependency(key: &str) -> impl Fn(EvalError) -> EvalError + '_ {
    move |error| match error {
        EvalError::Undefined => {
            EvalError::Inconclusive(format!("dependency flag '{}' not in snapshot", key))
        }
        other => other,
    }
}

/// How a resolved dependency value compares to the expected filter value.
fn flag_value_matches(actual: &FlagValue, expected: &Value) -> bool {
    match (actual, expected) {
        (FlagValue::Boolean(actual), Value::Bool(expected)) => actual == expected,
        (FlagValue::String(actual), Value::String(expected)) => {
            actual.eq_ignore_ascii_case(expected)
        }
        (FlagValue::Boolean(true), Value::String(expected)) => {
            expected.is_empty() || expected == "true"
        }
        (FlagValue::Boolean(false), Value::String(expected)) => {
            expected.is_empty() || expected == "false"
        }
        // Any variant counts as enabled.
        (FlagValue::String(_), Value::Bool(expected)) => *expected,
        _ => false,
    }
}

/// Variant assignment for a multivariate flag. Walks the declared variants
/// accumulating rollout shares; the first share covering the hashed point
/// wins, and a share total below 100 falls through to the last variant.
fn hashed_variant(flag: &FeatureFlag, hashed_identifier: &str) -> Option<String> {
    let variants = match flag.filters.multivariate {
        Some(ref multivariate) => &multivariate.variants,
        None => return None,
    };
    if variants.is_empty() {
        return None;
    }

    let hash_value = hash_key(&flag.key, hashed_identifier, VARIANT_HASH_SALT);
    let mut value_min = 0.0;
    for variant in variants.iter() {
        let value_max = value_min + variant.rollout_percentage / 100.0;
        if hash_value >= value_min && hash_value < value_max {
            return Some(variant.key.clone());
        }
        value_min = value_max;
    }
    variants.last().map(|variant| variant.key.clone())
}

/// Payload attached to a resolved value: keyed by variant, or by the
/// literal "true" for plain boolean flags.
fn payload_for(flag: &FeatureFlag, value: &FlagValue) -> Option<Value> {
    let payload_key = match value {
        FlagValue::String(variant) => variant.as_str(),
        FlagValue::Boolean(true) => "true",
        FlagValue::Boolean(false) => return None,
    };
    flag.filters.payloads.get(payload_key).cloned()
}

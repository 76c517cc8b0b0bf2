use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::Value;

use crate::flags::types::{Operator, PropertyFilter};

/// Global cache for compiled regexes to avoid recompilation on every flag
/// evaluation
static REGEX_CACHE: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();

/// Internal evaluation signal. Not an error in the user-facing sense:
/// callers pattern-match and either skip the condition group (Inconclusive)
/// or fall back to the remote decision endpoint (RequiresRemote).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EvalError {
    /// The property cannot be decided from the available attributes.
    Inconclusive(String),
    /// Evaluation needs state only the server has.
    RequiresRemote(String),
    /// The flag key has no (live) definition in the snapshot.
    Undefined,
}

pub(crate) type EvalResult<T> = Result<T, EvalError>;

impl EvalError {
    pub(crate) fn inconclusive(message: impl Into<String>) -> Self {
        EvalError::Inconclusive(message.into())
    }

    pub(crate) fn requires_remote(message: impl Into<String>) -> Self {
        EvalError::RequiresRemote(message.into())
    }

    pub(crate) fn message(&self) -> &str {
        match self {
            EvalError::Inconclusive(message) => message,
            EvalError::RequiresRemote(message) => message,
            EvalError::Undefined => "flag not found in snapshot",
        }
    }
}

fn get_cached_regex(pattern: &str) -> Option<Regex> {
    let cache = REGEX_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache_guard = match cache.lock() {
        Ok(guard) => guard,
        Err(_) => {
            tracing::warn!(pattern, "regex cache mutex poisoned, treating as cache miss");
            return None;
        }
    };

    if let Some(cached) = cache_guard.get(pattern) {
        return cached.clone();
    }

    let compiled = Regex::new(pattern).ok();
    cache_guard.insert(pattern.to_string(), compiled.clone());
    compiled
}

/// Evaluates one value-based property filter against an attribute map.
///
/// Cohort and flag-dependency filters never reach this function; the
/// evaluator resolves them against the snapshot. `now` anchors relative
/// date filters so a whole evaluation sees a single clock reading.
pub(crate) fn match_property(
    filter: &PropertyFilter,
    properties: &HashMap<String, Value>,
    now: DateTime<Utc>,
) -> EvalResult<bool> {
    let value = match properties.get(&filter.key) {
        Some(value) => value,
        None => {
            return match filter.operator {
                // Absence satisfies the negative operators.
                Operator::IsNotSet | Operator::IsNot => Ok(apply_negation(filter, true)),
                _ => Err(EvalError::inconclusive(format!(
                    "property '{}' not found in provided properties",
                    filter.key
                ))),
            };
        }
    };

    let matched = match filter.operator {
        Operator::Exact => any_value_matches(&filter.value, value),
        Operator::IsNot => !any_value_matches(&filter.value, value),
        Operator::IsSet => true,      // We already know the property exists
        Operator::IsNotSet => false,  // We already know the property exists
        Operator::Icontains => {
            let prop_str = value_to_string(value).to_lowercase();
            let search_str = value_to_string(&filter.value).to_lowercase();
            prop_str.contains(&search_str)
        }
        Operator::NotIcontains => {
            let prop_str = value_to_string(value).to_lowercase();
            let search_str = value_to_string(&filter.value).to_lowercase();
            !prop_str.contains(&search_str)
        }
        Operator::Regex | Operator::NotRegex => {
            let prop_str = value_to_string(value);
            let pattern = value_to_string(&filter.value);
            let regex = get_cached_regex(&pattern).ok_or_else(|| {
                EvalError::inconclusive(format!("invalid regex pattern: {}", pattern))
            })?;
            if filter.operator == Operator::Regex {
                regex.is_match(&prop_str)
            } else {
                !regex.is_match(&prop_str)
            }
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            compare_ordering(filter.operator, &filter.value, value)
        }
        Operator::IsDateBefore | Operator::IsDateAfter => {
            let target_date = parse_date_value(&filter.value, now).ok_or_else(|| {
                EvalError::inconclusive(format!(
                    "unable to parse target date value: {:?}",
                    filter.value
                ))
            })?;
            let prop_date = parse_date_value(value, now).ok_or_else(|| {
                EvalError::inconclusive(format!(
                    "unable to parse date value for '{}': {:?}",
                    filter.key, value
                ))
            })?;
            if filter.operator == Operator::IsDateBefore {
                prop_date < target_date
            } else {
                prop_date > target_date
            }
        }
        Operator::In | Operator::NotIn => {
            return Err(EvalError::inconclusive(
                "cohort filters are resolved against the flag snapshot",
            ));
        }
        Operator::FlagEvaluatesTo => {
            return Err(EvalError::inconclusive(
                "flag dependencies are resolved against the flag snapshot",
            ));
        }
        Operator::Unknown => {
            return Err(EvalError::inconclusive("unknown operator"));
        }
    };

    Ok(apply_negation(filter, matched))
}

/// Negation inverts conclusive outcomes only; Inconclusive stays as-is
/// (handled by the `?` before this point).
fn apply_negation(filter: &PropertyFilter, matched: bool) -> bool {
    if filter.negation.unwrap_or(false) {
        !matched
    } else {
        matched
    }
}

/// `exact`/`is_not` accept a scalar or a list of allowed values.
fn any_value_matches(expected: &Value, actual: &Value) -> bool {
    if let Some(candidates) = expected.as_array() {
        return candidates
            .iter()
            .any(|candidate| compare_values(candidate, actual));
    }
    compare_values(expected, actual)
}

fn compare_values(a: &Value, b: &Value) -> bool {
    // Case-insensitive string comparison
    if let (Some(a_str), Some(b_str)) = (a.as_str(), b.as_str()) {
        return a_str.eq_ignore_ascii_case(b_str);
    }

    // Direct comparison for other types
    a == b
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => value.to_string(),
    }
}

/// Numeric comparison when both sides parse as finite numbers, otherwise
/// lexicographic string comparison. Known interop risk when only one side
/// is numeric; the server's behavior for that case is unspecified.
fn compare_ordering(operator: Operator, expected: &Value, actual: &Value) -> bool {
    let expected_num = as_finite_number(expected);
    let actual_num = as_finite_number(actual);

    if let (Some(expected), Some(actual)) = (expected_num, actual_num) {
        match operator {
            Operator::Gt => actual > expected,
            Operator::Gte => actual >= expected,
            Operator::Lt => actual < expected,
            Operator::Lte => actual <= expected,
            _ => false,
        }
    } else {
        let expected_str = value_to_string(expected);
        let actual_str = value_to_string(actual);
        match operator {
            Operator::Gt => actual_str > expected_str,
            Operator::Gte => actual_str >= expected_str,
            Operator::Lt => actual_str < expected_str,
            Operator::Lte => actual_str <= expected_str,
            _ => false,
        }
    }
}

fn as_finite_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Parse a relative date string like "-7d", "-24h", "-2w", "-3m", "-1y";
/// returns the instant it denotes relative to `now`.
fn parse_relative_date(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    // Need at least 3 chars: "-", digit(s), and unit (e.g., "-7d")
    if value.len() < 3 || !value.starts_with('-') || !value.is_ascii() {
        return None;
    }

    let (num_str, unit) = value[1..].split_at(value.len() - 2);
    let num: i64 = num_str.parse().ok()?;

    let duration = match unit {
        "h" => chrono::Duration::hours(num),
        "d" => chrono::Duration::days(num),
        "w" => chrono::Duration::weeks(num),
        "m" => chrono::Duration::days(num * 30), // Approximate month as 30 days
        "y" => chrono::Duration::days(num * 365), // Approximate year as 365 days
        _ => return None,
    };

    Some(now - duration)
}

/// Parse a date value (ISO date, ISO datetime, or relative date).
fn parse_date_value(value: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date_str = value.as_str()?;

    if date_str.starts_with('-') && date_str.len() > 1 {
        if let Some(dt) = parse_relative_date(date_str, now) {
            return Some(dt);
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
        return Some(
            date.and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc(),
        );
    }

    None
}

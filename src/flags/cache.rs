use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::flags::types::FlagDecisions;

/// Per-request memoization of remote decision sets, keyed by the full
/// evaluation context. Two lookups for the same user but different person
/// properties miss each other; errors are never stored.
///
/// The cache is owned by whatever request scope created it; without a
/// scope every call goes to the network.
#[derive(Default)]
pub struct DecisionCache {
    entries: Mutex<HashMap<String, Arc<FlagDecisions>>>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<FlagDecisions>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: String, decisions: Arc<FlagDecisions>) {
        self.entries.lock().unwrap().insert(key, decisions);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical key over the evaluation context. serde_json's default map is
/// ordered, so serializing through `Value` yields one stable string per
/// structurally-equal context regardless of insertion order.
pub(crate) fn context_key(
    distinct_id: &str,
    groups: Option<&HashMap<String, String>>,
    person_properties: Option<&HashMap<String, Value>>,
    group_properties: Option<&HashMap<String, HashMap<String, Value>>>,
) -> String {
    let empty_groups = HashMap::new();
    let empty_person = HashMap::new();
    let empty_group_props = HashMap::new();
    let key = json!({
        "distinct_id": distinct_id,
        "groups": groups.unwrap_or(&empty_groups),
        "person_properties": person_properties.unwrap_or(&empty_person),
        "group_properties": group_properties.unwrap_or(&empty_group_props),
    });
    serde_json::to_string(&key).expect("context maps always serialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(entries: &[(&str, Value)]) -> HashMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn same_context_yields_same_key() {
        let a = person(&[("plan", json!("pro")), ("seats", json!(5))]);
        // Different insertion order, same entries.
        let b = person(&[("seats", json!(5)), ("plan", json!("pro"))]);

        assert_eq!(
            context_key("user-1", None, Some(&a), None),
            context_key("user-1", None, Some(&b), None)
        );
    }

    #[test]
    fn changed_properties_change_the_key() {
        let a = person(&[("plan", json!("pro"))]);
        let b = person(&[("plan", json!("free"))]);

        assert_ne!(
            context_key("user-1", None, Some(&a), None),
            context_key("user-1", None, Some(&b), None)
        );
        assert_ne!(
            context_key("user-1", None, Some(&a), None),
            context_key("user-2", None, Some(&a), None)
        );
    }

    #[test]
    fn absent_and_empty_context_are_equivalent() {
        assert_eq!(
            context_key("user-1", None, None, None),
            context_key("user-1", Some(&HashMap::new()), Some(&HashMap::new()), None)
        );
    }

    #[test]
    fn cache_stores_and_returns_by_key() {
        let cache = DecisionCache::new();
        let key = context_key("user-1", None, None, None);
        assert!(cache.get(&key).is_none());

        let decisions = Arc::new(FlagDecisions::default());
        cache.insert(key.clone(), decisions.clone());
        assert!(Arc::ptr_eq(&cache.get(&key).unwrap(), &decisions));
        assert_eq!(cache.len(), 1);
    }
}

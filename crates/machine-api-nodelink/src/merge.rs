//! Additive merges of Machine-declared metadata onto a Node
//!
//! The Node is the source of truth for anything it already carries: only
//! keys it lacks are added, and nothing is ever removed.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::Taint;

/// Taints from `desired` whose key `existing` lacks, appended in order
///
/// Returns `None` when nothing would be added, so callers can skip the
/// write. Applying the result again yields `None`.
pub fn merge_taints(existing: &[Taint], desired: &[Taint]) -> Option<Vec<Taint>> {
    let mut keys: HashSet<&str> = existing.iter().map(|t| t.key.as_str()).collect();
    let mut merged = existing.to_vec();
    for taint in desired {
        if keys.insert(taint.key.as_str()) {
            merged.push(taint.clone());
        }
    }
    (merged.len() > existing.len()).then_some(merged)
}

/// Labels from `desired` whose key `existing` lacks
pub fn missing_labels(
    existing: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(k, _)| !existing.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

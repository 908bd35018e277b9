//! Label selector evaluation for MachineSet admission

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// Whether `selector` matches `labels`
///
/// An empty selector matches everything. An unknown operator is an error
/// naming the offending requirement.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool, String> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }
    for (i, requirement) in selector.match_expressions.iter().flatten().enumerate() {
        let matched = requirement_matches(requirement, labels).map_err(|op| {
            format!(
                "matchExpressions[{i}].operator: Invalid value: \"{op}\": not a valid selector operator"
            )
        })?;
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn requirement_matches(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    let values = requirement.values.as_deref().unwrap_or_default();
    let current = labels.get(&requirement.key);
    match requirement.operator.as_str() {
        "In" => Ok(current.is_some_and(|v| values.contains(v))),
        "NotIn" => Ok(current.map_or(true, |v| !values.contains(v))),
        "Exists" => Ok(current.is_some()),
        "DoesNotExist" => Ok(current.is_none()),
        other => Err(other.to_string()),
    }
}

//! MachineSet Custom Resource Definition
//!
//! A MachineSet keeps a number of Machines stamped from one template.
//! Only its admission policy lives in this workspace; replica management
//! is handled by a separate controller.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::machine::MachineSpec;
use super::types::{AuthoritativeApi, Condition};
use crate::conditions::Conditioned;

/// Which Machines are removed first on scale down
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Pick any Machine
    Random,
    /// Prefer the most recently created Machines
    Newest,
    /// Prefer the oldest Machines
    Oldest,
}

/// Metadata stamped onto Machines created from the template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateMetadata {
    /// Labels applied to created Machines
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations applied to created Machines
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Template for Machines created by a MachineSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Metadata for created Machines
    #[serde(default)]
    pub metadata: MachineTemplateMetadata,
    /// Spec for created Machines
    #[serde(default)]
    pub spec: MachineSpec,
}

/// Specification for a MachineSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "MachineSet",
    plural = "machinesets",
    shortname = "ms",
    status = "MachineSetStatus",
    namespaced,
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.labelSelector"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of Machines
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Seconds a new Machine's node must be ready before it counts as available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,

    /// Scale-down victim selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_policy: Option<DeletePolicy>,

    /// Label query over Machines owned by this set
    #[serde(default)]
    pub selector: LabelSelector,

    /// Template for new Machines
    #[serde(default)]
    pub template: MachineTemplateSpec,

    /// API requested to own this MachineSet
    #[serde(
        default,
        rename = "authoritativeAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_api: Option<AuthoritativeApi>,
}

fn default_replicas() -> i32 {
    1
}

/// Observed state of a MachineSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    /// Number of Machines currently owned
    #[serde(default)]
    pub replicas: i32,
    /// Machines whose labels match the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fully_labeled_replicas: Option<i32>,
    /// Machines with a ready node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    /// Machines ready for at least minReadySeconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
    /// Generation last processed by the set controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Serialized selector for the scale subresource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    /// Machine-readable terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Human-readable terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Status conditions, sorted by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// API that currently owns this MachineSet
    #[serde(
        default,
        rename = "authoritativeAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_api: Option<AuthoritativeApi>,
}

impl Conditioned for MachineSet {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicas_default_to_one() {
        let spec: MachineSetSpec = serde_json::from_value(serde_json::json!({
            "selector": {"matchLabels": {"a": "b"}},
            "template": {"metadata": {"labels": {"a": "b"}}, "spec": {}}
        }))
        .unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.template.metadata.labels.get("a").map(String::as_str), Some("b"));
    }

    #[test]
    fn delete_policy_parses() {
        let spec: MachineSetSpec =
            serde_json::from_value(serde_json::json!({"deletePolicy": "Oldest"})).unwrap();
        assert_eq!(spec.delete_policy, Some(DeletePolicy::Oldest));
    }
}

//! Shared types used by the Machine and MachineSet CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase of a Machine's lifecycle
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// The instance is being created
    Provisioning,
    /// The instance exists but no node has joined yet
    Provisioned,
    /// A node backed by the instance is linked
    Running,
    /// The Machine is being torn down
    Deleting,
    /// Terminal error; requires human action
    Failed,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Provisioned => write!(f, "Provisioned"),
            Self::Running => write!(f, "Running"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Which API currently owns a Machine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AuthoritativeApi {
    /// These controllers own the object
    #[default]
    #[serde(rename = "MachineAPI")]
    MachineApi,
    /// Cluster API owns the object
    #[serde(rename = "ClusterAPI")]
    ClusterApi,
    /// Ownership is being handed over
    Migrating,
}

impl std::fmt::Display for AuthoritativeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MachineApi => write!(f, "MachineAPI"),
            Self::ClusterApi => write!(f, "ClusterAPI"),
            Self::Migrating => write!(f, "Migrating"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How bad a False condition is. Informational only.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConditionSeverity {
    /// No severity; used for True conditions
    #[default]
    #[serde(rename = "")]
    None,
    /// Informational
    Info,
    /// Something needs attention
    Warning,
    /// Something is broken
    Error,
}

impl ConditionSeverity {
    /// True for the empty severity, so it can be left out of the serialized form
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Drainable, InstanceExists)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Severity of a False condition
    #[serde(default, skip_serializing_if = "ConditionSeverity::is_none")]
    pub severity: ConditionSeverity,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            severity: ConditionSeverity::None,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Set the severity and return self for chaining
    pub fn severity(mut self, severity: ConditionSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// A named blocker registered by an external controller
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LifecycleHook {
    /// Unique name of the hook within its stage
    pub name: String,
    /// Who registered the hook; shown to operators when the hook blocks
    pub owner: String,
}

impl LifecycleHook {
    /// Create a hook with the given name and owner
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
        }
    }
}

impl std::fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{Name:{} Owner:{}}}", self.name, self.owner)
    }
}

/// Hooks that block the stages of Machine deletion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHooks {
    /// Hooks that must be removed before the node is drained
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_drain: Vec<LifecycleHook>,
    /// Hooks that must be removed before the instance is deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_terminate: Vec<LifecycleHook>,
}

impl LifecycleHooks {
    /// True when neither stage carries a hook
    pub fn is_empty(&self) -> bool {
        self.pre_drain.is_empty() && self.pre_terminate.is_empty()
    }
}

/// Opaque, platform-shaped machine configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderSpec {
    /// Raw provider configuration, decoded per platform at admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Option<serde_json::Value>,
}

/// Metadata to propagate to the node backing a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineMetadata {
    /// Labels to add to the node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations to add to the node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl MachineMetadata {
    /// True when there is nothing to propagate
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

/// Record of the last operation the controller attempted against the provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Human-readable description of the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When the operation record last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Outcome: Successful, Failed or Processing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Operation type: Create, Update or Delete
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub type_: Option<String>,
}

impl LastOperation {
    /// Equality ignoring the timestamp
    pub fn same_content(&self, other: &LastOperation) -> bool {
        self.description == other.description
            && self.state == other.state
            && self.type_ == other.type_
    }
}

/// Schema for free-form JSON: an object the API server must not prune
pub(crate) fn preserve_unknown_fields(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_none_is_omitted() {
        let c = Condition::new("Drained", ConditionStatus::True, "", "");
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("severity").is_none());
        assert!(json.get("reason").is_none());
        assert_eq!(json["type"], "Drained");
        assert_eq!(json["status"], "True");
    }

    #[test]
    fn severity_round_trips() {
        let c = Condition::new("Drained", ConditionStatus::False, "MachineDrainError", "boom")
            .severity(ConditionSeverity::Warning);
        let json = serde_json::to_string(&c).unwrap();
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.severity, ConditionSeverity::Warning);
    }

    #[test]
    fn authoritative_api_uses_api_spelling() {
        assert_eq!(
            serde_json::to_string(&AuthoritativeApi::ClusterApi).unwrap(),
            "\"ClusterAPI\""
        );
        let v: AuthoritativeApi = serde_json::from_str("\"Migrating\"").unwrap();
        assert_eq!(v, AuthoritativeApi::Migrating);
    }

    #[test]
    fn lifecycle_hook_display_names_owner() {
        let hook = LifecycleHook::new("migrate", "clusteroperator/etcd");
        assert_eq!(hook.to_string(), "{Name:migrate Owner:clusteroperator/etcd}");
    }

    #[test]
    fn lifecycle_hooks_parse_from_yaml() {
        let yaml = r#"
preDrain:
  - name: etcd
    owner: etcd-operator
"#;
        let hooks: LifecycleHooks = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hooks.pre_drain.len(), 1);
        assert!(hooks.pre_terminate.is_empty());
        assert!(!hooks.is_empty());
    }

    #[test]
    fn last_operation_comparison_ignores_time() {
        let a = LastOperation {
            description: Some("created".into()),
            last_updated: Some(Utc::now()),
            state: Some("Successful".into()),
            type_: Some("Create".into()),
        };
        let mut b = a.clone();
        b.last_updated = None;
        assert!(a.same_content(&b));
        b.state = Some("Failed".into());
        assert!(!a.same_content(&b));
    }
}

//! Machine Custom Resource Definition
//!
//! A Machine is a declarative request for one cloud or virtualization
//! instance backing a cluster node. Its phase is driven by the machine
//! controller through a provider actuator.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{NodeAddress, ObjectReference, Taint};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    preserve_unknown_fields, AuthoritativeApi, Condition, LastOperation, LifecycleHooks,
    MachineMetadata, MachinePhase, ProviderSpec,
};
use crate::conditions::{self, Conditioned};
use crate::{EXCLUDE_NODE_DRAINING_ANNOTATION, MACHINE_FINALIZER};

/// Address type indexed by the node linker
pub const INTERNAL_IP: &str = "InternalIP";

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    shortname = "ma",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".metadata.labels['machine\\.openshift\\.io/instance-type']"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".metadata.labels['machine\\.openshift\\.io/region']"}"#,
    printcolumn = r#"{"name":"Zone","type":"string","jsonPath":".metadata.labels['machine\\.openshift\\.io/zone']"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Labels and annotations propagated to the node
    #[serde(default, skip_serializing_if = "MachineMetadata::is_empty")]
    pub metadata: MachineMetadata,

    /// Named blockers for the drain and terminate stages of deletion
    #[serde(default, skip_serializing_if = "LifecycleHooks::is_empty")]
    pub lifecycle_hooks: LifecycleHooks,

    /// Taints merged additively onto the backing node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Platform-specific instance configuration
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Stable provider identifier, set by the actuator and never cleared
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// API requested to own this Machine
    #[serde(
        default,
        rename = "authoritativeAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_api: Option<AuthoritativeApi>,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node linked to this Machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// When the status content last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Machine-readable terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Human-readable terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Opaque per-provider snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,

    /// Addresses reported by the actuator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,

    /// Last operation attempted against the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    /// Current lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    /// Status conditions, sorted by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// API that currently owns this Machine
    #[serde(
        default,
        rename = "authoritativeAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_api: Option<AuthoritativeApi>,
}

impl MachineStatus {
    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: MachinePhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Add or update a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        conditions::set(&mut self.conditions, condition);
        self
    }

    /// Record a terminal error and return self for chaining
    pub fn error(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_reason = Some(reason.into());
        self.error_message = Some(message.into());
        self
    }

    /// Whether two statuses differ in content
    ///
    /// Timestamps (`lastUpdated`, condition transition times, the last
    /// operation's time) are ignored.
    pub fn content_differs(&self, other: &MachineStatus) -> bool {
        let last_op_differs = match (&self.last_operation, &other.last_operation) {
            (Some(a), Some(b)) => !a.same_content(b),
            (None, None) => false,
            _ => true,
        };

        self.phase != other.phase
            || self.addresses != other.addresses
            || self.provider_status != other.provider_status
            || self.error_message != other.error_message
            || self.error_reason != other.error_reason
            || self.node_ref != other.node_ref
            || self.authoritative_api != other.authoritative_api
            || last_op_differs
            || conditions::changed(&self.conditions, &other.conditions)
    }
}

impl Machine {
    /// `namespace/name` key used in logs and the node annotation
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Current phase, if any has been recorded
    pub fn phase(&self) -> Option<MachinePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Provider ID, treating the empty string as unset
    pub fn provider_id(&self) -> Option<&str> {
        self.spec.provider_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Addresses reported by the actuator
    pub fn addresses(&self) -> &[NodeAddress] {
        self.status
            .as_ref()
            .map(|s| s.addresses.as_slice())
            .unwrap_or(&[])
    }

    /// InternalIP addresses reported by the actuator
    pub fn internal_ips(&self) -> impl Iterator<Item = &str> {
        self.addresses()
            .iter()
            .filter(|a| a.type_ == INTERNAL_IP)
            .map(|a| a.address.as_str())
    }

    /// Name of the linked node, if any
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// The instance has been given an identity by the provider
    pub fn is_provisioned(&self) -> bool {
        self.provider_id().is_some() || !self.addresses().is_empty()
    }

    /// The Machine is quarantined in the Failed phase
    pub fn is_failed(&self) -> bool {
        self.phase() == Some(MachinePhase::Failed)
    }

    /// A node has been linked to this Machine
    pub fn has_node(&self) -> bool {
        self.node_name().is_some()
    }

    /// Deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The controller finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == MACHINE_FINALIZER)
    }

    /// The Machine asks for its node not to be drained
    pub fn excluded_from_drain(&self) -> bool {
        self.annotations()
            .contains_key(EXCLUDE_NODE_DRAINING_ANNOTATION)
    }

    /// API currently owning the Machine, as recorded in status
    pub fn authoritative_api(&self) -> Option<AuthoritativeApi> {
        self.status.as_ref().and_then(|s| s.authoritative_api)
    }

    /// Whether another API currently owns this Machine
    ///
    /// An unset value means these controllers own it.
    pub fn is_paused(&self) -> bool {
        !matches!(
            self.authoritative_api(),
            None | Some(AuthoritativeApi::MachineApi)
        )
    }
}

impl Conditioned for Machine {
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

//! Provider policies: per-platform providerSpec defaulting and validation
//!
//! Each platform implements [`ProviderPolicy`] over its own typed spec.
//! The blanket [`SpecPolicy`] impl erases the type so policies can sit in
//! one [`PolicyRegistry`] keyed by [`Platform`] and work on the raw
//! `providerSpec.value` JSON carried by Machines.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use machine_api_common::Platform;

use crate::providers::{aws, azure, gcp, nutanix, powervs, vsphere};

/// Field path prefix used in every providerSpec message
pub const PROVIDER_SPEC: &str = "providerSpec";

/// Cluster facts the defaulters and validators depend on
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterInfo {
    /// Infrastructure platform
    pub platform: Platform,
    /// Infrastructure name, used as the cluster-id label value
    pub cluster_id: String,
    /// Cloud region, when the platform has one
    pub region: Option<String>,
    /// GCP project hosting the cluster
    pub gcp_project_id: Option<String>,
    /// vSphere datacenter used when a workspace names none
    pub vsphere_datacenter: Option<String>,
}

/// One rejected field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path of the offending field
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    /// Create a field error
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Accumulated admission findings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    /// Findings that reject the request
    pub errors: Vec<FieldError>,
    /// Findings returned to the client as warnings
    pub warnings: Vec<String>,
}

impl Verdict {
    /// An empty verdict
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rejecting finding
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    /// Record a warning
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Record `Required value` for an empty field
    pub fn require(&mut self, present: bool, field: &str, message: impl Into<String>) {
        if !present {
            self.error(field, format!("Required value: {}", message.into()));
        }
    }

    /// Record `Unsupported value` unless `value` is one of `allowed`
    pub fn one_of(&mut self, value: &str, allowed: &[&str], field: &str) {
        if !allowed.contains(&value) {
            let quoted: Vec<String> = allowed.iter().map(|a| format!("\"{a}\"")).collect();
            self.error(
                field,
                format!(
                    "Unsupported value: \"{value}\": supported values: {}",
                    quoted.join(", ")
                ),
            );
        }
    }

    /// Fold another verdict into this one
    pub fn merge(&mut self, other: Verdict) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        self.errors.is_empty()
    }

    /// All errors joined for the admission response
    pub fn message(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Reference to a Secret from a providerSpec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Secret namespace; the object's own namespace when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl SecretRef {
    /// Reference by name only
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
        }
    }

    /// Whether the reference names a Secret
    pub fn is_set(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Default Secret holding ignition user data for workers
pub const DEFAULT_USER_DATA_SECRET: &str = "worker-user-data";

/// What a policy validates against besides the spec itself
#[derive(Clone, Copy, Debug)]
pub struct SpecTarget<'a> {
    /// Name of the Machine or MachineSet
    pub name: &'a str,
    /// Cluster facts
    pub cluster: &'a ClusterInfo,
}

/// Typed defaulting and validation for one platform's providerSpec
pub trait ProviderPolicy: Send + Sync {
    /// Decoded providerSpec shape
    type Spec: DeserializeOwned + Serialize + Default;

    /// Platform this policy serves
    const PLATFORM: Platform;

    /// Fill unset fields from cluster facts
    fn apply_defaults(&self, spec: &mut Self::Spec, cluster: &ClusterInfo);

    /// Check required fields and known-invalid combinations
    fn validate(&self, spec: &Self::Spec, target: &SpecTarget<'_>) -> Verdict;

    /// Credentials Secret whose absence deserves a warning
    fn credentials_secret(&self, spec: &Self::Spec) -> Option<SecretRef>;
}

/// Type-erased [`ProviderPolicy`] over raw providerSpec JSON
pub trait SpecPolicy: Send + Sync {
    /// Platform this policy serves
    fn platform(&self) -> Platform;

    /// Defaulted providerSpec value
    fn default_value(
        &self,
        value: Option<&Value>,
        cluster: &ClusterInfo,
    ) -> Result<Value, FieldError>;

    /// Validate a providerSpec value
    fn validate_value(&self, value: Option<&Value>, target: &SpecTarget<'_>) -> Verdict;

    /// Credentials Secret named by a providerSpec value
    fn credentials_secret(&self, value: Option<&Value>) -> Option<SecretRef>;
}

impl<P: ProviderPolicy> SpecPolicy for P {
    fn platform(&self) -> Platform {
        P::PLATFORM
    }

    fn default_value(
        &self,
        value: Option<&Value>,
        cluster: &ClusterInfo,
    ) -> Result<Value, FieldError> {
        let mut spec: P::Spec = decode(value, P::PLATFORM)?;
        self.apply_defaults(&mut spec, cluster);
        serde_json::to_value(&spec).map_err(|e| {
            FieldError::new(
                format!("{PROVIDER_SPEC}.value"),
                format!("failed to encode {} providerSpec: {e}", P::PLATFORM),
            )
        })
    }

    fn validate_value(&self, value: Option<&Value>, target: &SpecTarget<'_>) -> Verdict {
        match decode::<P::Spec>(value, P::PLATFORM) {
            Ok(spec) => self.validate(&spec, target),
            Err(e) => Verdict {
                errors: vec![e],
                warnings: Vec::new(),
            },
        }
    }

    fn credentials_secret(&self, value: Option<&Value>) -> Option<SecretRef> {
        decode::<P::Spec>(value, P::PLATFORM)
            .ok()
            .and_then(|spec| ProviderPolicy::credentials_secret(self, &spec))
    }
}

fn decode<T: DeserializeOwned + Default>(
    value: Option<&Value>,
    platform: Platform,
) -> Result<T, FieldError> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            FieldError::new(
                format!("{PROVIDER_SPEC}.value"),
                format!("failed to decode {platform} providerSpec: {e}"),
            )
        }),
    }
}

/// Policies keyed by platform
///
/// Platforms without an entry admit providerSpecs untouched.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<Platform, Arc<dyn SpecPolicy>>,
}

impl PolicyRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in platform policy
    pub fn builtin() -> Self {
        Self::new()
            .with(aws::AwsPolicy)
            .with(azure::AzurePolicy)
            .with(gcp::GcpPolicy)
            .with(vsphere::VSpherePolicy)
            .with(powervs::PowerVsPolicy)
            .with(nutanix::NutanixPolicy)
    }

    /// Register a policy under its platform
    pub fn with(mut self, policy: impl SpecPolicy + 'static) -> Self {
        self.policies.insert(policy.platform(), Arc::new(policy));
        self
    }

    /// Policy for a platform
    pub fn get(&self, platform: Platform) -> Option<&dyn SpecPolicy> {
        self.policies.get(&platform).map(|p| p.as_ref())
    }
}

/// Names occurring more than once, each reported at its first repeat
pub(crate) fn first_duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = std::collections::HashSet::new();
    let mut reported = std::collections::HashSet::new();
    let mut duplicates = Vec::new();
    for name in names {
        if !seen.insert(name) && reported.insert(name) {
            duplicates.push(name);
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_cloud_platform_is_registered() {
        let registry = PolicyRegistry::builtin();
        for platform in [
            Platform::Aws,
            Platform::Azure,
            Platform::Gcp,
            Platform::VSphere,
            Platform::PowerVs,
            Platform::Nutanix,
        ] {
            assert_eq!(registry.get(platform).map(|p| p.platform()), Some(platform));
        }
        assert!(registry.get(Platform::None).is_none());
        assert!(registry.get(Platform::BareMetal).is_none());
    }

    #[test]
    fn undecodable_spec_is_a_field_error() {
        let registry = PolicyRegistry::builtin();
        let cluster = ClusterInfo::default();
        let target = SpecTarget {
            name: "m",
            cluster: &cluster,
        };
        let verdict = registry
            .get(Platform::Aws)
            .unwrap()
            .validate_value(Some(&json!({"instanceType": 7})), &target);

        assert!(!verdict.is_allowed());
        assert_eq!(verdict.errors[0].field, "providerSpec.value");
    }

    #[test]
    fn verdict_helpers_format_like_field_errors() {
        let mut verdict = Verdict::new();
        verdict.require(false, "providerSpec.region", "expected region");
        verdict.one_of("x", &["", "a"], "providerSpec.kind");
        verdict.one_of("a", &["", "a"], "providerSpec.kind");

        assert_eq!(verdict.errors.len(), 2);
        assert_eq!(
            verdict.message(),
            "providerSpec.region: Required value: expected region, providerSpec.kind: Unsupported value: \"x\": supported values: \"\", \"a\""
        );
    }

    #[test]
    fn duplicates_are_reported_once_in_order() {
        assert_eq!(
            first_duplicates(["a", "b", "a", "c", "b", "a"]),
            vec!["a", "b"]
        );
        assert!(first_duplicates(["a", "b"]).is_empty());
    }
}
